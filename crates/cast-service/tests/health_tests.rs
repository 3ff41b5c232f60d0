//! Integration tests for health checks and engine failure handling.

use cast_service::actors::RouterExit;
use cast_test_utils::TestCastServer;
use reqwest::StatusCode;

#[tokio::test]
async fn test_health_endpoint_returns_ok() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;

    let response = reqwest::get(format!("{}/health", server.url())).await?;

    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_ready_once_runtime_started() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;

    let response = reqwest::get(format!("{}/ready", server.url())).await?;

    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_metrics_not_mounted_without_recorder() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;

    // Falls through to the static file service, which has no such file
    let response = reqwest::get(format!("{}/metrics", server.url())).await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_static_files_served_from_public_dir() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let public = server.workspace().public_dir();
    tokio::fs::create_dir_all(&public).await?;
    tokio::fs::write(public.join("index.html"), "<h1>duocast</h1>").await?;

    let response = reqwest::get(format!("{}/index.html", server.url())).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await?, "<h1>duocast</h1>");
    Ok(())
}

#[tokio::test]
async fn test_engine_death_clears_readiness_and_exits() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;

    server.engine().report_fatal("worker crashed");

    assert!(
        server.wait_until(|s| !s.state().health.is_ready()).await,
        "Readiness should drop after engine death"
    );
    let response = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let exit = server.shutdown().await;
    assert_eq!(exit, RouterExit::EngineDied("worker crashed".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_graceful_shutdown_reports_clean_exit() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    alice
        .request("get-rtp-capabilities", serde_json::Value::Null)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e.message))?;

    let exit = server.shutdown().await;

    assert_eq!(exit, RouterExit::Shutdown);
    assert!(alice.is_closed_by_server().await);
    Ok(())
}
