use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};

use crate::jobs::{JobKind, JobRunner};
use crate::status::StatusProvider;
use crate::system::SystemControl;

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct ApiContext {
    pub runner: JobRunner,
    pub status: StatusProvider,
    pub system: Arc<dyn SystemControl>,
    pub reboot_delay: Duration,
}

pub async fn run_http_api<F>(
    addr: SocketAddr,
    ctx: Arc<ApiContext>,
    shutdown: F,
) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { handle(req, ctx).await }
            }))
        }
    });

    hyper::Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
}

fn with_json_headers(mut resp: Response<Body>) -> Response<Body> {
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    resp
}

fn raw_json(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    with_json_headers(resp)
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    raw_json(status, value.to_string())
}

fn message(status: StatusCode, kind: &str, msg: &str) -> Response<Body> {
    json_response(status, json!({ "status": kind, "message": msg }))
}

pub async fn handle(req: Request<Body>, ctx: Arc<ApiContext>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    log::info!("{method} {path}");

    let response = match (method, path.as_str()) {
        (Method::GET, "/") => handle_root(&ctx).await,
        (Method::GET, "/status") => handle_status(&ctx).await,
        (Method::POST, "/sync") => handle_start(&ctx, JobKind::Sync).await,
        (Method::POST, "/cleanup") => handle_start(&ctx, JobKind::Cleanup).await,
        (Method::POST, "/stop") => handle_stop(&ctx).await,
        (Method::POST, "/reboot") => handle_reboot(&ctx),
        _ => message(StatusCode::NOT_FOUND, "error", "Not found"),
    };

    Ok(response)
}

async fn handle_root(ctx: &ApiContext) -> Response<Body> {
    let active_job = ctx.runner.active().await.map(|job| {
        json!({
            "kind": job.kind.as_str(),
            "started_at_ms": job.started_at_ms,
            "timeout_secs": job.timeout.as_secs(),
        })
    });

    json_response(
        StatusCode::OK,
        json!({
            "service": "TeslaUSB API",
            "version": "1.0",
            "endpoints": {
                "GET /status": "Get current status",
                "POST /sync": "Start music sync",
                "POST /cleanup": "Run cleanup only",
                "POST /stop": "Stop running sync",
                "POST /reboot": "Reboot system"
            },
            "active_job": active_job,
        }),
    )
}

async fn handle_status(ctx: &ApiContext) -> Response<Body> {
    match ctx.status.get_status().await {
        Ok(body) => raw_json(StatusCode::OK, body),
        Err(e) => {
            log::error!("Status error: {e}");
            message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error",
                &format!("Status error: {e}"),
            )
        }
    }
}

async fn handle_start(ctx: &ApiContext, kind: JobKind) -> Response<Body> {
    match ctx.runner.start(kind).await {
        Ok(_) => message(
            StatusCode::OK,
            "success",
            &format!("{} started", kind.label()),
        ),
        Err(e) if e.is_rejection() => message(StatusCode::BAD_REQUEST, "error", &e.to_string()),
        Err(e) => {
            log::error!("{} start failed: {e}", kind.label());
            message(StatusCode::INTERNAL_SERVER_ERROR, "error", &e.to_string())
        }
    }
}

async fn handle_stop(ctx: &ApiContext) -> Response<Body> {
    let report = ctx.runner.stop().await;
    if report.stopped() {
        message(StatusCode::OK, "success", "Sync stopped gracefully")
    } else {
        message(StatusCode::OK, "info", "No sync running to stop")
    }
}

fn handle_reboot(ctx: &ApiContext) -> Response<Body> {
    let system = Arc::clone(&ctx.system);
    let delay = ctx.reboot_delay;
    tokio::spawn(async move {
        // Give the response a moment to reach the caller.
        tokio::time::sleep(delay).await;
        log::info!("Rebooting on request");
        if let Err(e) = system.reboot().await {
            log::error!("Reboot failed: {e}");
        }
    });

    message(StatusCode::OK, "success", "Reboot initiated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobSettings, LockManager};
    use crate::network::ConnectivityProbe;
    use crate::system::testing::FakeSystem;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    // Long-running for job flags, quick for the status refresh after a stop.
    const LONG_JOB: &str = r#"[ "$1" = "--send-ha-status" ] || sleep 30"#;

    struct Harness {
        _dir: TempDir,
        ctx: Arc<ApiContext>,
        system: Arc<FakeSystem>,
        udc: std::path::PathBuf,
    }

    fn harness(job_script: &str) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let system = Arc::new(FakeSystem::default());
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            job_script.to_string(),
            "sync-music.sh".to_string(),
        ];
        let udc = dir.path().join("UDC");
        let status = StatusProvider::new(
            dir.path().join("teslausb_status.json"),
            command.clone(),
            Duration::from_secs(5),
        );
        let lock = LockManager::new(
            dir.path().join("music_sync.lock"),
            system.clone(),
            crate::jobs::lock::tests::targets(),
        );
        let settings = JobSettings {
            command,
            sync_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(30),
            reboot_delay: Duration::from_millis(10),
            reboot_after_sync: false,
            reboot_after_cleanup: false,
        };
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = JobRunner::new(
            settings,
            lock,
            ConnectivityProbe::new(&udc),
            status.clone(),
            system.clone(),
            tx,
        );
        let ctx = Arc::new(ApiContext {
            runner,
            status,
            system: system.clone(),
            reboot_delay: Duration::from_millis(10),
        });
        Harness {
            _dir: dir,
            ctx,
            system,
            udc,
        }
    }

    async fn call(ctx: &Arc<ApiContext>, method: Method, uri: &str) -> (StatusCode, Response<Body>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = handle(req, Arc::clone(ctx)).await.expect("handle ok");
        (resp.status(), resp)
    }

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn sync_while_disconnected_is_rejected_without_lock() {
        let h = harness(LONG_JOB);

        let (status, resp) = call(&h.ctx, Method::POST, "/sync").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            HeaderValue::from_static("*")
        );
        assert_eq!(
            body_json(resp).await,
            json!({"status": "error", "message": "Tesla not connected - no point syncing"})
        );
        assert!(!h.ctx.runner.lock().path().exists());
        assert!(h.ctx.runner.active().await.is_none());
    }

    #[tokio::test]
    async fn cleanup_then_sync_reports_already_running() {
        let h = harness(LONG_JOB);
        std::fs::write(&h.udc, "fe980000.usb\n").expect("write UDC");

        let (status, resp) = call(&h.ctx, Method::POST, "/cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "success", "message": "Cleanup started"})
        );

        let (status, resp) = call(&h.ctx, Method::POST, "/sync").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "error", "message": "Sync already running"})
        );

        h.ctx.runner.stop().await;
    }

    #[tokio::test]
    async fn stop_without_job_is_info_and_repeatable() {
        let h = harness("exit 0");

        for _ in 0..2 {
            let (status, resp) = call(&h.ctx, Method::POST, "/stop").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(
                body_json(resp).await,
                json!({"status": "info", "message": "No sync running to stop"})
            );
        }
    }

    #[tokio::test]
    async fn stop_running_job_reports_success() {
        let h = harness(LONG_JOB);
        call(&h.ctx, Method::POST, "/cleanup").await;

        let (status, resp) = call(&h.ctx, Method::POST, "/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "success");
        assert!(!h.ctx.runner.is_running().await);
    }

    #[tokio::test]
    async fn status_serves_snapshot_verbatim() {
        let h = harness("exit 0");
        std::fs::write(h.ctx.status.snapshot_path(), r#"{"state":"idle"}"#).expect("snapshot");

        let (status, resp) = call(&h.ctx, Method::GET, "/status?refresh=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );
        assert_eq!(body_json(resp).await, json!({"state": "idle"}));
    }

    #[tokio::test]
    async fn status_read_failure_is_500() {
        let h = harness("exit 0");
        std::fs::create_dir(h.ctx.status.snapshot_path()).expect("dir in place of snapshot");

        let (status, resp) = call(&h.ctx, Method::GET, "/status").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["status"], "error");
    }

    #[tokio::test]
    async fn root_lists_endpoints() {
        let h = harness("exit 0");

        let (status, resp) = call(&h.ctx, Method::GET, "/").await;
        assert_eq!(status, StatusCode::OK);
        let doc = body_json(resp).await;
        assert_eq!(doc["service"], "TeslaUSB API");
        assert_eq!(doc["endpoints"]["POST /stop"], "Stop running sync");
        assert!(doc["active_job"].is_null());
    }

    #[tokio::test]
    async fn unknown_route_and_wrong_method_are_404() {
        let h = harness("exit 0");

        let (status, _) = call(&h.ctx, Method::GET, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.ctx, Method::GET, "/sync").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reboot_responds_first_then_reboots() {
        let h = harness("exit 0");

        let (status, resp) = call(&h.ctx, Method::POST, "/reboot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "success", "message": "Reboot initiated"})
        );

        for _ in 0..100 {
            if h.system.reboots.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reboot was never triggered");
    }
}
