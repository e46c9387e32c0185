use crate::config::Config;
use crate::dispatch::DelayedQueue;
use crate::lock::LockManager;
use crate::models::{
    AcquireLockRequest, AcquireSemaphoreRequest, ApiResponse, ConsumeTaskRequest,
    ExtendLockRequest, ReleaseRequest, ScheduleTaskRequest, ScheduleTaskResponse,
    SemaphoreMode, SemaphoreTokenRequest, Task, TokenResponse,
};
use crate::semaphore::SemaphoreManager;
use crate::store::Store;
use actix_web::{web, HttpResponse};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use utoipa::OpenApi;

/// 单次消费请求允许的最长阻塞时间
const MAX_BLOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// 各协调原语共享同一个存储
#[derive(Clone)]
pub struct AppState {
    pub locks: LockManager,
    pub semaphores: SemaphoreManager,
    pub queue: DelayedQueue,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        let locks = LockManager::new(store.clone(), config.lock_config());
        let semaphores = SemaphoreManager::new(store.clone(), locks.clone(), config.semaphore_config());
        let queue = DelayedQueue::new(store, locks.clone(), config.queue_config());
        Self {
            locks,
            semaphores,
            queue,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        acquire_lock,
        extend_lock,
        release_lock,
        acquire_semaphore,
        refresh_semaphore,
        release_semaphore,
        schedule_task,
        consume_task
    ),
    components(
        schemas(
            AcquireLockRequest,
            ExtendLockRequest,
            ReleaseRequest,
            TokenResponse,
            SemaphoreMode,
            AcquireSemaphoreRequest,
            SemaphoreTokenRequest,
            ScheduleTaskRequest,
            ScheduleTaskResponse,
            ConsumeTaskRequest,
            Task,
            ApiResponse<TokenResponse>,
            ApiResponse<ScheduleTaskResponse>,
            ApiResponse<Task>,
            ApiResponse<serde_json::Value>,
        )
    ),
    tags(
        (name = "lock", description = "分布式锁接口"),
        (name = "semaphore", description = "计数信号量接口"),
        (name = "task", description = "延迟任务接口")
    ),
    info(
        title = "分布式协调服务 API",
        version = "0.1.0",
        description = "基于共享键值存储的锁、信号量和延迟任务队列",
    )
)]
pub struct ApiDoc;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/lock/acquire", web::post().to(acquire_lock))
        .route("/api/lock/extend", web::post().to(extend_lock))
        .route("/api/lock/release", web::post().to(release_lock))
        .route("/api/semaphore/acquire", web::post().to(acquire_semaphore))
        .route("/api/semaphore/refresh", web::post().to(refresh_semaphore))
        .route("/api/semaphore/release", web::post().to(release_semaphore))
        .route("/api/tasks/schedule", web::post().to(schedule_task))
        .route("/api/tasks/consume", web::post().to(consume_task));
}

/// 申请锁接口
#[utoipa::path(
    post,
    path = "/api/lock/acquire",
    tag = "lock",
    request_body = AcquireLockRequest,
    responses(
        (status = 200, description = "申请锁成功", body = ApiResponse<TokenResponse>),
        (status = 200, description = "等待超时，锁仍被占用", body = ApiResponse<TokenResponse>)
    )
)]
pub async fn acquire_lock(state: web::Data<AppState>, req: web::Json<AcquireLockRequest>) -> HttpResponse {
    info!(
        "[LOCK] Attempting to acquire lock - name: {}, acquire_timeout: {}ms, hold_timeout: {}ms",
        req.name, req.acquire_timeout_ms, req.hold_timeout_ms
    );

    let acquired = state
        .locks
        .acquire(
            &req.name,
            Duration::from_millis(req.acquire_timeout_ms),
            Duration::from_millis(req.hold_timeout_ms),
        )
        .await;

    match acquired {
        Ok(Some(token)) => {
            info!("[LOCK SUCCESS] Lock acquired - name: {}, token: {}", req.name, token);
            HttpResponse::Ok().json(ApiResponse::success(TokenResponse { token }))
        }
        Ok(None) => {
            info!("[LOCK FAILED] Lock still held after waiting - name: {}", req.name);
            HttpResponse::Ok().json(ApiResponse::<TokenResponse>::error(
                1001,
                format!("Lock '{}' is held by another client", req.name),
            ))
        }
        Err(e) => {
            error!("Failed to acquire lock: {}", e);
            HttpResponse::Ok().json(ApiResponse::<TokenResponse>::error(
                1004,
                format!("Failed to acquire lock: {}", e),
            ))
        }
    }
}

/// 续期接口
#[utoipa::path(
    post,
    path = "/api/lock/extend",
    tag = "lock",
    request_body = ExtendLockRequest,
    responses(
        (status = 200, description = "续期成功", body = ApiResponse<serde_json::Value>),
        (status = 200, description = "锁已过期或不属于该 token", body = ApiResponse<serde_json::Value>)
    )
)]
pub async fn extend_lock(state: web::Data<AppState>, req: web::Json<ExtendLockRequest>) -> HttpResponse {
    info!("[LOCK] Extend request - name: {}, hold_timeout: {}ms", req.name, req.hold_timeout_ms);

    match state
        .locks
        .extend(&req.name, &req.token, Duration::from_millis(req.hold_timeout_ms))
        .await
    {
        Ok(true) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "extended": true
        }))),
        Ok(false) => {
            info!("[LOCK] Extend rejected, lock lost - name: {}", req.name);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                2001,
                "Lock expired or not owned".to_string(),
            ))
        }
        Err(e) => {
            error!("Failed to extend lock: {}", e);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                2002,
                format!("Failed to extend lock: {}", e),
            ))
        }
    }
}

/// 释放锁接口
#[utoipa::path(
    post,
    path = "/api/lock/release",
    tag = "lock",
    request_body = ReleaseRequest,
    responses(
        (status = 200, description = "释放锁成功", body = ApiResponse<serde_json::Value>),
        (status = 200, description = "锁不存在或不属于该 token", body = ApiResponse<serde_json::Value>)
    )
)]
pub async fn release_lock(state: web::Data<AppState>, req: web::Json<ReleaseRequest>) -> HttpResponse {
    info!("[LOCK] Attempting to release lock - name: {}", req.name);

    match state.locks.release(&req.name, &req.token).await {
        Ok(true) => {
            info!("[LOCK SUCCESS] Lock released - name: {}", req.name);
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "released": true
            })))
        }
        Ok(false) => {
            info!("[LOCK FAILED] Lock not found or not owned - name: {}", req.name);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                3001,
                "Lock not found or not owned".to_string(),
            ))
        }
        Err(e) => {
            error!("Failed to release lock: {}", e);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                3002,
                format!("Failed to release lock: {}", e),
            ))
        }
    }
}

/// 申请信号量接口
#[utoipa::path(
    post,
    path = "/api/semaphore/acquire",
    tag = "semaphore",
    request_body = AcquireSemaphoreRequest,
    responses(
        (status = 200, description = "获得名额", body = ApiResponse<TokenResponse>),
        (status = 200, description = "名额已满", body = ApiResponse<TokenResponse>)
    )
)]
pub async fn acquire_semaphore(
    state: web::Data<AppState>,
    req: web::Json<AcquireSemaphoreRequest>,
) -> HttpResponse {
    info!(
        "[SEMAPHORE] Attempting to acquire - name: {}, limit: {}, timeout: {}ms, mode: {:?}",
        req.name, req.limit, req.timeout_ms, req.mode
    );

    let timeout = Duration::from_millis(req.timeout_ms);
    let semaphores = &state.semaphores;
    let acquired = match req.mode {
        SemaphoreMode::Simple => semaphores.acquire(&req.name, req.limit, timeout).await,
        SemaphoreMode::Fair => semaphores.acquire_fair(&req.name, req.limit, timeout).await,
        SemaphoreMode::Locked => semaphores.acquire_fair_with_lock(&req.name, req.limit, timeout).await,
    };

    match acquired {
        Ok(Some(token)) => HttpResponse::Ok().json(ApiResponse::success(TokenResponse { token })),
        Ok(None) => HttpResponse::Ok().json(ApiResponse::<TokenResponse>::error(
            4001,
            format!("Semaphore '{}' is full", req.name),
        )),
        Err(e) => {
            error!("Failed to acquire semaphore: {}", e);
            HttpResponse::Ok().json(ApiResponse::<TokenResponse>::error(
                4002,
                format!("Failed to acquire semaphore: {}", e),
            ))
        }
    }
}

/// 刷新信号量接口（仅公平信号量）
#[utoipa::path(
    post,
    path = "/api/semaphore/refresh",
    tag = "semaphore",
    request_body = SemaphoreTokenRequest,
    responses(
        (status = 200, description = "刷新成功", body = ApiResponse<serde_json::Value>),
        (status = 200, description = "名额已丢失", body = ApiResponse<serde_json::Value>)
    )
)]
pub async fn refresh_semaphore(
    state: web::Data<AppState>,
    req: web::Json<SemaphoreTokenRequest>,
) -> HttpResponse {
    if req.mode == SemaphoreMode::Simple {
        return HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
            5003,
            "Refresh requires a fair semaphore".to_string(),
        ));
    }

    match state.semaphores.refresh_fair(&req.name, &req.token).await {
        Ok(true) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "refreshed": true
        }))),
        Ok(false) => {
            info!("[SEMAPHORE] Refresh found slot lost - name: {}", req.name);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                5001,
                "Semaphore slot lost".to_string(),
            ))
        }
        Err(e) => {
            error!("Failed to refresh semaphore: {}", e);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                5002,
                format!("Failed to refresh semaphore: {}", e),
            ))
        }
    }
}

/// 释放信号量接口
#[utoipa::path(
    post,
    path = "/api/semaphore/release",
    tag = "semaphore",
    request_body = SemaphoreTokenRequest,
    responses(
        (status = 200, description = "释放成功", body = ApiResponse<serde_json::Value>),
        (status = 200, description = "名额不存在", body = ApiResponse<serde_json::Value>)
    )
)]
pub async fn release_semaphore(
    state: web::Data<AppState>,
    req: web::Json<SemaphoreTokenRequest>,
) -> HttpResponse {
    info!("[SEMAPHORE] Attempting to release - name: {}, mode: {:?}", req.name, req.mode);

    let released = match req.mode {
        SemaphoreMode::Simple => state.semaphores.release(&req.name, &req.token).await,
        SemaphoreMode::Fair | SemaphoreMode::Locked => {
            state.semaphores.release_fair(&req.name, &req.token).await
        }
    };

    match released {
        Ok(true) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "released": true
        }))),
        Ok(false) => HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
            6001,
            "Semaphore slot not found".to_string(),
        )),
        Err(e) => {
            error!("Failed to release semaphore: {}", e);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                6002,
                format!("Failed to release semaphore: {}", e),
            ))
        }
    }
}

/// 提交任务接口
#[utoipa::path(
    post,
    path = "/api/tasks/schedule",
    tag = "task",
    request_body = ScheduleTaskRequest,
    responses(
        (status = 200, description = "提交成功", body = ApiResponse<ScheduleTaskResponse>)
    )
)]
pub async fn schedule_task(state: web::Data<AppState>, req: web::Json<ScheduleTaskRequest>) -> HttpResponse {
    let req = req.into_inner();
    let delay = Duration::from_millis(req.delay_ms);

    match state.queue.schedule(&req.queue, &req.handler, req.args, delay).await {
        Ok(task_id) => HttpResponse::Ok().json(ApiResponse::success(ScheduleTaskResponse { task_id })),
        Err(e) => {
            error!("Failed to schedule task: {}", e);
            HttpResponse::Ok().json(ApiResponse::<ScheduleTaskResponse>::error(
                7001,
                format!("Failed to schedule task: {}", e),
            ))
        }
    }
}

/// 消费任务接口
#[utoipa::path(
    post,
    path = "/api/tasks/consume",
    tag = "task",
    request_body = ConsumeTaskRequest,
    responses(
        (status = 200, description = "取到任务", body = ApiResponse<Task>),
        (status = 200, description = "超时内没有就绪任务", body = ApiResponse<Task>)
    )
)]
pub async fn consume_task(state: web::Data<AppState>, req: web::Json<ConsumeTaskRequest>) -> HttpResponse {
    let block_timeout = Duration::from_millis(req.block_timeout_ms).min(MAX_BLOCK_TIMEOUT);

    match state.queue.consume(&req.queue, block_timeout).await {
        Ok(Some(task)) => {
            info!("[CONSUME] Task popped - id: {}, queue: {}", task.id, req.queue);
            HttpResponse::Ok().json(ApiResponse::success(task))
        }
        Ok(None) => HttpResponse::Ok().json(ApiResponse::<Task>::error(
            7002,
            format!("No task ready in queue '{}'", req.queue),
        )),
        Err(e) => {
            error!("Failed to consume task: {}", e);
            HttpResponse::Ok().json(ApiResponse::<Task>::error(
                7003,
                format!("Failed to consume task: {}", e),
            ))
        }
    }
}
