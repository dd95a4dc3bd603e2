//! End-to-end tests against a real Docker daemon.
//!
//! Ignored by default: they need the daemon and the sandbox image
//! (`docker build -t kernelbox-sandbox:latest docker/`). Run with
//! `cargo test -- --ignored`.

use kernelbox::config::SandboxConfig;
use kernelbox::container::SandboxSession;
use kernelbox::models::OutputFragment;

fn test_settings() -> SandboxConfig {
    let mut settings = SandboxConfig::default();
    if let Ok(image) = std::env::var("KERNELBOX_TEST_IMAGE") {
        settings.image = image;
    }
    settings
}

#[tokio::test]
#[ignore = "requires Docker and the sandbox image"]
async fn state_persists_across_executions() {
    let session = SandboxSession::start(test_settings()).await.unwrap();

    let first = session.execute("x = 1").await.unwrap();
    assert!(!first.has_error());

    let second = session.execute("print(x + 1)").await.unwrap();
    let stdout: String = second
        .fragments
        .iter()
        .filter_map(|f| match f {
            OutputFragment::Stdout { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(stdout, "2\n");
    assert!(!second.has_error());

    session.close().await;
}

#[tokio::test]
#[ignore = "requires Docker and the sandbox image"]
async fn raised_exception_becomes_one_error_fragment() {
    let session = SandboxSession::start(test_settings()).await.unwrap();

    let output = session
        .execute("raise ValueError('boom')")
        .await
        .unwrap();

    let errors: Vec<_> = output
        .fragments
        .iter()
        .filter(|f| f.is_error())
        .collect();
    assert_eq!(errors.len(), 1);
    match errors[0] {
        OutputFragment::Error {
            ename,
            evalue,
            traceback,
        } => {
            assert_eq!(ename, "ValueError");
            assert_eq!(evalue, "boom");
            assert!(!traceback.contains('\u{1b}'));
        }
        other => panic!("expected error fragment, got {:?}", other),
    }

    // The session survived the exception
    let after = session.execute("print('still alive')").await.unwrap();
    assert!(!after.has_error());

    session.close().await;
}

#[tokio::test]
#[ignore = "requires Docker and the sandbox image"]
async fn execution_with_no_output_is_empty_not_an_error() {
    let session = SandboxSession::start(test_settings()).await.unwrap();

    let output = session.execute("y = 41 + 1").await.unwrap();
    assert!(output.is_empty());

    session.close().await;
}

#[tokio::test]
#[ignore = "requires Docker and the sandbox image"]
async fn close_after_real_start_is_idempotent() {
    let session = SandboxSession::start(test_settings()).await.unwrap();

    session.close().await;
    session.close().await;

    let err = session.execute("x = 1").await.unwrap_err();
    assert_eq!(err.code(), "NOT_READY");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn container_that_exits_immediately_is_a_premature_exit() {
    // hello-world prints and exits long before any connection file appears
    let settings = SandboxConfig {
        image: "hello-world:latest".to_string(),
        ..SandboxConfig::default()
    };

    let err = SandboxSession::start(settings).await.unwrap_err();
    assert_eq!(err.code(), "PREMATURE_EXIT");
}
