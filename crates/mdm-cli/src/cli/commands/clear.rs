//! `mdm clear` – drop completed and failed jobs from history.

use anyhow::Result;
use mdm_core::config::MdmConfig;
use mdm_core::control::ControlRequest;

use super::{dispatch, expect_count};

pub async fn run_clear(cfg: &MdmConfig) -> Result<()> {
    let count = expect_count(dispatch(cfg, ControlRequest::ClearFinished).await?)?;
    println!("Cleared {count} finished job(s)");
    Ok(())
}
