#[tokio::main]
async fn main() {
    if let Err(error) = pdfdesk_app::run_from_env().await {
        tracing::error!("{error:#}");
        eprintln!("pdfdesk: {error:#}");
        std::process::exit(1);
    }
}
