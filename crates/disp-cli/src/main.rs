//! `disp-cli`: an operator CLI for inspecting and manually creating queues
//! without standing up the (out-of-scope) HTTP collaborator. `queue create`
//! is the in-process equivalent of that collaborator's POST handler: it
//! calls the same `Store::create_queue` entry point the dispatch path never
//! calls directly.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use disp_schemas::NewQueueItem;
use disp_store::Store;

#[derive(Parser)]
#[command(name = "disp-cli")]
#[command(about = "Operator CLI for the medication-dispensing dispatcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue inspection and creation.
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },
    /// Node readiness inspection.
    Node {
        #[command(subcommand)]
        cmd: NodeCmd,
    },
}

#[derive(Subcommand)]
enum QueueCmd {
    /// Create a queue with one pill item (repeat --item for more).
    Create {
        #[arg(long)]
        patient_id: i64,
        #[arg(long)]
        target_room: i64,
        #[arg(long)]
        queue_number: i64,
        /// `pill_id:quantity`, may be repeated.
        #[arg(long = "item", required = true)]
        items: Vec<String>,
    },
    /// Show one queue plus its items and audit events.
    Show {
        queue_id: i64,
    },
    /// List queues, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    /// Print the persisted readiness row for a node.
    Status {
        node_id: i64,
    },
}

fn parse_item(raw: &str) -> Result<NewQueueItem> {
    let (pill_id, quantity) = raw
        .split_once(':')
        .with_context(|| format!("--item {raw:?} must be of the form pill_id:quantity"))?;
    Ok(NewQueueItem {
        pill_id: pill_id.trim().parse().with_context(|| format!("invalid pill_id in {raw:?}"))?,
        quantity: quantity.trim().parse().with_context(|| format!("invalid quantity in {raw:?}"))?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    let config_path = std::env::var("DISP_CONFIG_FILE").ok().map(std::path::PathBuf::from);
    let config = disp_config::load(config_path.as_deref()).context("loading dispatcher configuration")?;
    let store = Store::connect(&config.sqlite_path).await.context("opening dispatcher store")?;

    match cli.cmd {
        Commands::Queue { cmd } => run_queue_cmd(&store, cmd).await?,
        Commands::Node { cmd } => run_node_cmd(&store, cmd).await?,
    }
    Ok(())
}

async fn run_queue_cmd(store: &Store, cmd: QueueCmd) -> Result<()> {
    match cmd {
        QueueCmd::Create {
            patient_id,
            target_room,
            queue_number,
            items,
        } => {
            let items: Vec<NewQueueItem> = items.iter().map(|s| parse_item(s)).collect::<Result<_>>()?;
            let queue_id = store.create_queue(patient_id, target_room, queue_number, &items).await?;
            println!("queue_id={queue_id}");
        }
        QueueCmd::Show { queue_id } => {
            let queue = store
                .get_queue(queue_id)
                .await?
                .with_context(|| format!("no queue with id {queue_id}"))?;
            println!(
                "id={} patient_id={} target_room={} status={} queue_number={} created_at={} served_at={:?} note={:?} failed_reason={:?}",
                queue.id,
                queue.patient_id,
                queue.target_room,
                queue.status.as_str(),
                queue.queue_number,
                queue.created_at,
                queue.served_at,
                queue.note,
                queue.failed_reason
            );
            for item in store.queue_items(queue_id).await? {
                println!("  item pill_id={} quantity={}", item.pill_id, item.quantity);
            }
            for event in store.list_events(queue_id).await? {
                println!("  event[{}] {} {} {}", event.id, event.timestamp, event.event_kind, event.message);
            }
        }
        QueueCmd::List { status } => {
            let queues = if let Some(status) = status {
                let parsed = disp_schemas::QueueStatus::parse(&status)
                    .with_context(|| format!("unknown status {status:?}"))?;
                if parsed == disp_schemas::QueueStatus::Pending {
                    store
                        .next_pending()
                        .await?
                        .map(|q| vec![q.queue])
                        .unwrap_or_default()
                } else if parsed == disp_schemas::QueueStatus::InProgress {
                    store.list_in_progress().await?
                } else {
                    anyhow::bail!("listing terminal-status queues is not supported by this CLI; use `queue show`")
                }
            } else {
                store.list_in_progress().await?
            };
            for queue in queues {
                println!("id={} status={} patient_id={}", queue.id, queue.status.as_str(), queue.patient_id);
            }
        }
    }
    Ok(())
}

async fn run_node_cmd(store: &Store, cmd: NodeCmd) -> Result<()> {
    match cmd {
        NodeCmd::Status { node_id } => match store.get_node_status(node_id).await? {
            Some(status) => println!(
                "node_id={} online={} ready={} uptime={:?} last_seen={} last_ready_change={}",
                status.node_id, status.online, status.ready, status.uptime, status.last_seen, status.last_ready_change
            ),
            None => println!("node_id={node_id} has never reported in"),
        },
    }
    Ok(())
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("DISP_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_parses_pill_id_and_quantity() {
        let item = parse_item("2:3").unwrap();
        assert_eq!(item.pill_id, 2);
        assert_eq!(item.quantity, 3);
    }

    #[test]
    fn item_without_a_colon_is_rejected() {
        assert!(parse_item("bogus").is_err());
    }
}
