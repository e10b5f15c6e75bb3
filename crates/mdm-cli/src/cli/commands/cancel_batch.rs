//! `mdm cancel-batch <id>` – cancel every unfinished member of a batch.

use anyhow::Result;
use mdm_core::config::MdmConfig;
use mdm_core::control::ControlRequest;

use super::{dispatch, expect_count};

pub async fn run_cancel_batch(cfg: &MdmConfig, batch_id: &str) -> Result<()> {
    let request = ControlRequest::CancelBatch {
        batch_id: batch_id.to_string(),
    };
    let count = expect_count(dispatch(cfg, request).await?)?;
    println!("Cancelled {count} job(s) of batch {batch_id}");
    Ok(())
}
