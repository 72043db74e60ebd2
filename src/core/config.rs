use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub storage_path: String,
    pub db_path: String,
    pub web_dir: String,
    pub openai_model: String,
    pub openai_api_hostname: String,
    pub openai_api_key: String,
    pub stream_timeout: Duration,
    // Only set when a playground server should be polled for new
    // versions
    pub server_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let storage_path = env::var("PLAYGROUND_STORAGE_PATH").unwrap_or("./".to_string());
        let db_path = format!("{}/db", storage_path.trim_end_matches('/'));
        let web_dir = env::var("PLAYGROUND_WEB_DIR").unwrap_or("./web-ui".to_string());
        let openai_api_hostname = env::var("PLAYGROUND_LLM_HOST")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());
        let openai_api_key =
            env::var("OPENAI_API_KEY").unwrap_or_else(|_| "thiswontworkforopenai".to_string());
        let openai_model =
            env::var("PLAYGROUND_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".to_string());
        let stream_timeout = env::var("PLAYGROUND_STREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));
        let server_url = env::var("PLAYGROUND_SERVER_URL").ok();

        Self {
            storage_path,
            db_path,
            web_dir,
            openai_model,
            openai_api_hostname,
            openai_api_key,
            stream_timeout,
            server_url,
        }
    }
}
