//! `mdm remove-batch <id>` – forget a batch.
//!
//! Members still waiting for a slot are dropped; submitted ones stay as plain
//! jobs.

use anyhow::Result;
use mdm_core::config::MdmConfig;
use mdm_core::control::ControlRequest;

use super::{dispatch, expect_ack};

pub async fn run_remove_batch(cfg: &MdmConfig, batch_id: &str) -> Result<()> {
    let request = ControlRequest::RemoveBatch {
        batch_id: batch_id.to_string(),
    };
    if expect_ack(dispatch(cfg, request).await?)? {
        println!("Forgot batch {batch_id}");
    } else {
        println!("No batch {batch_id}");
    }
    Ok(())
}
