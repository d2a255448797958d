use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};

use dotenv::dotenv;
use futures::{Stream, StreamExt};
use gai_core::{RagAnswer, RagRequest};
use gai_error::{ErrorMetadataBuilder, GaiError};
use gai_rag::{load_config, EmbeddingJob, EmbeddingPipeline, RagPipeline, Services};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

#[derive(Clone)]
struct AppState {
    rag: Arc<RagPipeline>,
    embedding: EmbeddingPipeline,
}

impl AppState {
    fn from_services(services: &Services) -> Result<Self, GaiError> {
        Ok(Self {
            rag: Arc::new(RagPipeline::from_services(services)?),
            embedding: EmbeddingPipeline::from_services(services),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg = load_config()?;
    let services = Services::build(&cfg)?;
    let app = router(AppState::from_services(&services)?);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    tracing::info!(%addr, "gai-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ask", post(ask))
        .route("/api/v1/ask/sync", post(ask_sync))
        .route("/api/v1/datasets/:dataset_id/embeddings", post(embed_dataset))
        .route("/api/v1/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// 按组件记录错误后原样返回，交给 IntoResponse 映射状态码
fn report(err: GaiError, operation: &str, dataset_id: &str) -> GaiError {
    let meta = ErrorMetadataBuilder::new("gai-api")
        .operation(operation)
        .dataset_id(dataset_id)
        .build(&err);
    err.log(&meta);
    err
}

// 每个 SSE message 事件都是一个完整的 JSON 对象
fn message_event<T: Serialize>(value: &T) -> Event {
    match Event::default().event("message").json_data(value) {
        Ok(event) => event,
        Err(e) => error_event(&GaiError::Serialization {
            format: "json".to_string(),
            message: e.to_string(),
        }),
    }
}

fn error_event(err: &GaiError) -> Event {
    let body = serde_json::json!({
        "error": err.to_string(),
        "message": err.user_message(),
    });
    Event::default().event("error").data(body.to_string())
}

async fn ask(
    State(state): State<AppState>,
    Json(req): Json<RagRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GaiError> {
    let mut answer = state
        .rag
        .ask(&req)
        .await
        .map_err(|e| report(e, "ask", &req.dataset_id))?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    let dataset_id = req.dataset_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    info!(%dataset_id, "client disconnected, aborting answer");
                    answer.abort();
                    return;
                }
                item = answer.next() => match item {
                    Some(Ok(event)) => {
                        if tx.send(Ok(message_event(&event))).await.is_err() {
                            answer.abort();
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let err = report(err, "ask_stream", &dataset_id);
                        let _ = tx.send(Ok(error_event(&err))).await;
                        return;
                    }
                    None => {
                        debug!(%dataset_id, "answer stream finished");
                        return;
                    }
                }
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

async fn ask_sync(
    State(state): State<AppState>,
    Json(req): Json<RagRequest>,
) -> Result<Json<RagAnswer>, GaiError> {
    state
        .rag
        .answer(&req)
        .await
        .map(Json)
        .map_err(|e| report(e, "ask_sync", &req.dataset_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn embed_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Json(body): Json<EmbedRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut job = EmbeddingJob::new(dataset_id, body.columns);
    if let Some(query) = body.query.filter(|q| !q.trim().is_empty()) {
        job.query = query;
    }
    job.instruction = body.instruction;
    job.description = body.description;
    info!(dataset_id = %job.dataset_id, columns = job.columns.len(), "embedding requested");

    // 客户端断开后流水线继续在后台运行
    let events = state
        .embedding
        .run(job)
        .map(|event| Ok::<_, Infallible>(message_event(&event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use gai_rag::config::parse_config;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
server:
  host: 127.0.0.1
  port: 0
chat_provider:
  kind: ollama
  base_url: http://127.0.0.1:9
  model: command-r7b
embedding_provider:
  kind: ollama
  base_url: http://127.0.0.1:9
  model: mxbai-embed-large
vector_store:
  kind: memory
source_store:
  kind: memory
web_search:
  base_url: http://127.0.0.1:9
"#;

    fn app() -> Router {
        let cfg = parse_config(CONFIG).unwrap();
        let services = Services::build(&cfg).unwrap();
        router(AppState::from_services(&services).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("ok"));
    }

    #[tokio::test]
    async fn blank_question_is_bad_request() {
        let resp = app()
            .oneshot(post_json(
                "/api/v1/ask/sync",
                serde_json::json!({"datasetId": "cities", "question": "  "}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found_before_streaming() {
        let resp = app()
            .oneshot(post_json(
                "/api/v1/ask",
                serde_json::json!({"datasetId": "nope", "question": "What is the capital?"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn embedding_without_columns_streams_one_failed_event() {
        let resp = app()
            .oneshot(post_json(
                "/api/v1/datasets/cities/embeddings",
                serde_json::json!({"columns": []}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_text(resp).await;
        assert_eq!(body.matches("event: message").count(), 1);
        assert!(body.contains("\"failed\":true"));
        assert!(body.contains("No columns selected"));
    }
}
