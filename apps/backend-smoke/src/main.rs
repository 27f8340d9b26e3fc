use std::env;

use backend_core::MessageBackend;
use backend_supabase::{SupabaseBackend, SupabaseConfig};

#[tokio::main]
async fn main() {
    let url = env::var("CHATROOM_SUPABASE_URL").unwrap_or_default();
    let anon_key = env::var("CHATROOM_SUPABASE_ANON_KEY").unwrap_or_default();
    let table = env::var("CHATROOM_MESSAGES_TABLE").ok();

    let config = match SupabaseConfig::new(&url, &anon_key) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid Supabase settings: {err}");
            eprintln!("Required: CHATROOM_SUPABASE_URL and CHATROOM_SUPABASE_ANON_KEY");
            std::process::exit(2);
        }
    };
    let config = match table {
        Some(table) => match config.with_table(&table) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Invalid table name: {err}");
                std::process::exit(2);
            }
        },
        None => config,
    };

    let backend = match SupabaseBackend::new(config) {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("Failed to initialize backend: {err}");
            std::process::exit(1);
        }
    };

    match backend.list_messages().await {
        Ok(messages) => {
            println!(
                "Supabase backend reachable: {} message(s) in '{}'.",
                messages.len(),
                backend.config().table()
            );
            if let Some(last) = messages.last() {
                println!("Latest: [{}] {}: {}", last.created_at, last.username, last.content);
            }
        }
        Err(err) => {
            eprintln!("Bulk load failed: {err}");
            std::process::exit(1);
        }
    }
}
