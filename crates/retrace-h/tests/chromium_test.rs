use retrace_engine::backend::{BindingRequest, CaptureEvent, DriverBinding, DriverLauncher};
use retrace_engine::config::schema::DriverConfig;
use retrace_engine::protocol::{SessionMetadata, StepAction, WaitCondition};
use retrace_h::ChromiumLauncher;
use retrace_h::cdp::EngineKey;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const LOGIN_PAGE: &str = "data:text/html,<html><head><title>Login</title></head><body>\
<form onsubmit='return false'>\
<input id='username' name='username' placeholder='Username'>\
<select id='country'><option value='fr'>France</option><option value='de'>Germany</option></select>\
<button id='submit' type='button' onclick='document.getElementById(\"out\").textContent=\"Welcome\"'>Sign in</button>\
</form><p id='out'></p></body></html>";

fn launcher() -> ChromiumLauncher {
    ChromiumLauncher::new(DriverConfig {
        no_sandbox: true,
        ..DriverConfig::default()
    })
}

async fn bind(
    launcher: &ChromiumLauncher,
    session_id: &str,
) -> Option<(Arc<dyn DriverBinding>, mpsc::Receiver<CaptureEvent>)> {
    let (capture, events) = mpsc::channel(64);
    let request = BindingRequest {
        session_id: session_id.to_string(),
        metadata: SessionMetadata::default(),
        capture,
    };
    match launcher.bind(request).await {
        Ok(binding) => Some((binding, events)),
        Err(e) => {
            eprintln!("Skipping test: Headless browser not available: {}", e);
            None
        }
    }
}

#[tokio::test]
#[serial]
async fn locates_and_drives_elements() {
    let launcher = launcher();
    let Some((binding, _events)) = bind(&launcher, "drive").await else {
        return;
    };

    let nav = binding.navigate(LOGIN_PAGE).await.expect("navigate");
    assert_eq!(nav.title, "Login");

    let short = Duration::from_millis(300);
    assert!(binding.locate("#username", short).await.unwrap());
    assert!(binding.locate("text=Sign in", short).await.unwrap());
    assert!(binding.locate("button:has-text(\"Sign in\")", short).await.unwrap());
    assert!(binding.locate("role=button", short).await.unwrap());
    assert!(binding.locate("//input[@name='username']", short).await.unwrap());
    assert!(!binding.locate("#missing", short).await.unwrap());
    assert!(!binding.locate("[[not css", short).await.unwrap());

    binding
        .perform(
            &StepAction::Fill {
                value: "alice".into(),
            },
            Some("#username"),
            short,
        )
        .await
        .unwrap();
    binding
        .perform(
            &StepAction::Select { value: "de".into() },
            Some("#country"),
            short,
        )
        .await
        .unwrap();
    binding
        .perform(&StepAction::Click { double: false }, Some("#submit"), short)
        .await
        .unwrap();
    assert_eq!(binding.read_text("#out").await.unwrap(), "Welcome");

    binding
        .perform(
            &StepAction::Wait {
                condition: WaitCondition::Visible,
            },
            Some("#out"),
            short,
        )
        .await
        .unwrap();
    assert!(
        binding
            .perform(&StepAction::Click { double: false }, Some("#missing"), short)
            .await
            .is_err()
    );

    let png = binding.screenshot().await.unwrap();
    assert_eq!(&png[1..4], b"PNG");

    binding.close().await.unwrap();
    binding.close().await.unwrap();
    assert!(binding.navigate(LOGIN_PAGE).await.is_err());
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn capture_forwards_interactions() {
    let launcher = launcher();
    let Some((binding, mut events)) = bind(&launcher, "capture").await else {
        return;
    };
    binding.navigate(LOGIN_PAGE).await.expect("navigate");
    binding.start_capture().await.unwrap();
    binding.start_capture().await.unwrap();

    binding
        .perform(
            &StepAction::Click { double: false },
            Some("#submit"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let captured = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let CaptureEvent::Step(draft) = event {
                return Some(draft);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .expect("a captured step");
    assert_eq!(captured.action, StepAction::Click { double: false });
    assert_eq!(captured.locator.as_deref(), Some("#submit"));

    binding.close().await.unwrap();
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn contexts_share_one_engine() {
    let launcher = launcher();
    let Some((first, _a)) = bind(&launcher, "first").await else {
        return;
    };
    let (second, _b) = bind(&launcher, "second").await.expect("second context");
    let key = EngineKey {
        kind: SessionMetadata::default().browser,
        headless: true,
    };
    assert_eq!(launcher.pool().contexts(key).await, 2);

    first.close().await.unwrap();
    assert_eq!(launcher.pool().contexts(key).await, 1);
    assert!(second.navigate(LOGIN_PAGE).await.is_ok());

    second.close().await.unwrap();
    assert_eq!(launcher.pool().contexts(key).await, 0);
    launcher.shutdown().await.unwrap();
}
