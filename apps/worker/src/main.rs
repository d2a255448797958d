use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::StreamExt;
use gai_core::EmbeddingEvent;
use gai_rag::{load_config, load_config_from, EmbeddingJob, EmbeddingPipeline, Services};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Parser)]
#[command(name = "gai-worker", about = "Batch jobs for the RAG datasets")]
struct Cli {
    /// 配置文件路径，缺省时读取 GAI_CONFIG 或 configs/default.yaml
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a dataset into its vector index, printing every event as one JSON line.
    Embed {
        #[arg(long)]
        dataset: String,

        /// Query selecting the source documents.
        #[arg(long, default_value = "*")]
        query: String,

        /// Comma-separated list of fields to embed.
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,

        /// Curation instruction applied to every document.
        #[arg(long)]
        instruction: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let services = Services::build(&cfg)?;

    match cli.command {
        Commands::Embed {
            dataset,
            query,
            columns,
            instruction,
            description,
        } => {
            let mut job = EmbeddingJob::new(dataset, columns);
            job.query = query;
            job.instruction = instruction;
            job.description = description;

            tracing::info!(dataset_id = %job.dataset_id, "gai-worker embedding started");
            let last = print_events(EmbeddingPipeline::from_services(&services).run(job)).await?;
            match last {
                Some(event) if event.finished => Ok(()),
                Some(event) => anyhow::bail!(
                    "embedding failed: {}",
                    event.error.unwrap_or(event.message)
                ),
                None => anyhow::bail!("embedding stream closed without a terminal event"),
            }
        }
    }
}

/// 每个事件输出为一行 JSON，返回最后一个事件
async fn print_events(
    mut events: impl futures::Stream<Item = EmbeddingEvent> + Unpin,
) -> anyhow::Result<Option<EmbeddingEvent>> {
    let mut last = None;
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        last = Some(event);
    }
    Ok(last)
}

fn init_tracing() {
    // 日志写到 stderr，stdout 只输出事件
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
