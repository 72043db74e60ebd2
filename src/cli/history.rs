use anyhow::Result;

use crate::chat::{SessionStore, SqliteSessionStore};
use crate::core::db::{async_db, initialize_db};

pub async fn run(db_path: &str, clear: bool) -> Result<()> {
    let db = async_db(db_path).await?;
    db.call(|conn| {
        initialize_db(conn)?;
        Ok(())
    })
    .await?;
    let store = SqliteSessionStore::new(&db);

    if clear {
        store.clear().await?;
        println!("Deleted the saved conversation");
        return Ok(());
    }

    let Some(record) = store.load().await? else {
        println!("No saved conversation");
        return Ok(());
    };

    println!(
        "{} messages, model {}\n",
        record.messages.len(),
        record.model_config.model
    );
    for (i, turn) in record.messages.iter().enumerate() {
        println!(
            "[{}] {:?} ({}):\n{}\n",
            i + 1,
            turn.role,
            turn.created_at.format("%Y-%m-%d %H:%M"),
            turn.content
        );
    }

    Ok(())
}
