use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use fe_coord_service::config::{Config, StorageType};
use fe_coord_service::handlers::{self, AppState};
use fe_coord_service::store::memory::MemoryStore;
use fe_coord_service::store::redis::RedisStore;
use fe_coord_service::{DelayedQueue, Store};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// 分发器出错后重启前的等待时间
const DISPATCHER_RESTART_DELAY: Duration = Duration::from_secs(1);

fn spawn_dispatchers(queue: &DelayedQueue, count: usize, stop: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let queue = queue.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    match queue.run_dispatcher(stop.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            error!("[DISPATCH] Dispatcher {} failed, restarting: {}", id, e);
                            tokio::time::sleep(DISPATCHER_RESTART_DELAY).await;
                        }
                    }
                }
            })
        })
        .collect()
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // 加载配置
    let config = Config::from_env();
    info!("Starting fe-coord-service with config: {:?}", config);

    // 创建存储
    let store: Arc<dyn Store> = match config.storage_type {
        StorageType::Memory => {
            info!("Using memory store");
            Arc::new(MemoryStore::new())
        }
        StorageType::Redis => {
            info!("Using Redis store");
            let redis_url = config.redis_url.as_deref().context("Redis URL not configured")?;
            let store = RedisStore::new(
                redis_url,
                config.redis_username.clone(),
                config.redis_password.clone(),
                config.redis_db,
            )
            .await
            .context("Failed to connect to Redis")?;
            Arc::new(store)
        }
    };

    let state = AppState::new(store, &config);

    // 启动分发器
    let (stop_tx, stop_rx) = watch::channel(false);
    let dispatchers = spawn_dispatchers(&state.queue, config.dispatcher_count, &stop_rx);
    info!("Started {} dispatcher(s)", dispatchers.len());

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Server starting on http://{}", bind_addr);
    info!("Swagger UI available at http://{}/swagger-ui/", bind_addr);

    // 启动 HTTP 服务
    let data = web::Data::new(state);
    let served = HttpServer::new(move || {
        let openapi = handlers::ApiDoc::openapi();

        App::new()
            .wrap(Logger::default())
            .app_data(data.clone())
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi))
            .configure(handlers::configure)
    })
    .bind(&bind_addr)?
    .run()
    .await;

    // 服务退出后停止分发器
    info!("Server stopped, shutting down dispatchers");
    let _ = stop_tx.send(true);
    for handle in dispatchers {
        if let Err(e) = handle.await {
            error!("[DISPATCH] Dispatcher task panicked: {}", e);
        }
    }

    served?;
    Ok(())
}
