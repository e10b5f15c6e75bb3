#![allow(dead_code)]

pub mod fake_tools;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use mdm_core::job::{JobKind, JobRequest, MediaSelector};

pub fn request(id: &str, source: &str, out: &Path) -> JobRequest {
    JobRequest {
        id: id.to_string(),
        source: source.to_string(),
        output_dir: out.to_path_buf(),
        base_name: id.to_string(),
        kind: JobKind::infer(source),
        media: MediaSelector::video(Some("720p".to_string())),
        batch: None,
    }
}

/// Poll `check` every 20ms until it returns true; panics after 15s.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(15), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
