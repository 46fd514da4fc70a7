use actix_cors::Cors;
use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod service;
pub mod signing;

/// Start the main application: pretty logs in debug, JSON in release, then
/// the HTTP server, then a drain of in-flight background syncs on shutdown.
pub async fn run() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("HOOKLINE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("HOOKLINE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let listen_addr = config.listen_addr().to_owned();

    let service = service::Service::connect_with(config).await?;

    let data = Data::new(service);
    let app_data = data.clone();

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allow_any_method();

        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(api::auth::SecretAuth)
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(cors)
            .service(api::sync::service())
            .service(api::triggers::service())
            .service(api::webhooks::service())
            .service(api::deliveries::service())
            .app_data(app_data.clone())
            .app_data(json_cfg)
    })
    .bind(listen_addr)?
    .run()
    .await?;

    // Let fire-and-forget batches finish before the process exits.
    data.drain().await;

    Ok(())
}
