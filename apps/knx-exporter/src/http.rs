//! Scrape endpoint.

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use device_registry::MetricStore;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Content type of the Prometheus text exposition format.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

const PROJECT_URL: &str = "https://github.com/philunet/knx_exporter";

#[derive(Clone)]
struct AppState {
    store: Arc<MetricStore>,
    metrics_path: Arc<str>,
}

pub fn router(store: Arc<MetricStore>, metrics_path: &str) -> Router {
    let state = AppState {
        store,
        metrics_path: Arc::from(metrics_path),
    };
    let mut router = Router::new().route(metrics_path, get(metrics));
    if metrics_path != "/" {
        router = router.route("/", get(landing));
    }
    router.with_state(state)
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>KNX Exporter</title></head>\n<body>\n\
         <h1>KNX Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         <h2>More information:</h2>\n\
         <p><a href=\"{PROJECT_URL}\">{PROJECT_URL}</a></p>\n\
         </body>\n</html>\n",
        path = state.metrics_path
    ))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], state.store.encode_text())
}

/// Serve the scrape endpoint until the listener fails.
pub async fn serve(
    listener: TcpListener,
    store: Arc<MetricStore>,
    metrics_path: String,
) -> anyhow::Result<()> {
    axum::serve(listener, router(store, &metrics_path)).await?;
    Ok(())
}
