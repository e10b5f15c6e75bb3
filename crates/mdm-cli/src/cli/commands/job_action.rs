//! `mdm pause|resume|cancel|retry|remove <id>`.

use anyhow::Result;
use mdm_core::config::MdmConfig;
use mdm_core::control::ControlRequest;

use super::{dispatch, expect_ack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Pause,
    Resume,
    Cancel,
    Retry,
    Remove,
}

impl JobAction {
    fn request(self, id: &str) -> ControlRequest {
        let id = id.to_string();
        match self {
            JobAction::Pause => ControlRequest::Pause { id },
            JobAction::Resume => ControlRequest::Resume { id },
            JobAction::Cancel => ControlRequest::Cancel { id },
            JobAction::Retry => ControlRequest::Retry { id },
            JobAction::Remove => ControlRequest::Remove { id },
        }
    }

    pub fn outcome(self, id: &str, changed: bool) -> String {
        match (self, changed) {
            (JobAction::Pause, true) => format!("Paused job {id}"),
            (JobAction::Pause, false) => format!("Job {id} is not pending or running"),
            (JobAction::Resume, true) => format!("Resumed job {id}"),
            (JobAction::Resume, false) => format!("Job {id} is not paused"),
            (JobAction::Cancel, true) => format!("Cancelled job {id}"),
            (JobAction::Cancel, false) => format!("No job {id}"),
            (JobAction::Retry, true) => format!("Queued job {id} again"),
            (JobAction::Retry, false) => format!("Job {id} has not failed"),
            (JobAction::Remove, true) => format!("Removed job {id}"),
            (JobAction::Remove, false) => format!("Job {id} is not finished"),
        }
    }
}

pub async fn run_job_action(cfg: &MdmConfig, action: JobAction, id: &str) -> Result<()> {
    let changed = expect_ack(dispatch(cfg, action.request(id)).await?)?;
    println!("{}", action.outcome(id, changed));
    Ok(())
}
