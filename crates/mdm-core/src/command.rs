//! Build the tool invocation for a job.

use std::path::Path;

use crate::job::{JobKind, JobRequest, MediaKind};
use crate::services::{ResolvedTool, Tool};
use crate::supervisor::LaunchSpec;

/// Tool choice and job arguments, before the tool is located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub tool: Tool,
    pub args: Vec<String>,
}

impl CommandPlan {
    pub fn for_request(request: &JobRequest, cookie_args: Vec<String>) -> Self {
        match request.kind {
            JobKind::SimpleFetch => Self {
                tool: Tool::Fetch,
                args: fetch_args(request, cookie_args),
            },
            JobKind::StreamRemux => Self {
                tool: Tool::Remux,
                args: remux_args(request),
            },
        }
    }

    pub fn into_launch(self, tool: ResolvedTool) -> LaunchSpec {
        let mut args = tool.leading_args;
        args.extend(self.args);
        LaunchSpec {
            program: tool.program,
            args,
        }
    }
}

fn output_path(dir: &Path, file_name: String) -> String {
    dir.join(file_name).to_string_lossy().into_owned()
}

fn fetch_args(request: &JobRequest, cookie_args: Vec<String>) -> Vec<String> {
    let template = output_path(&request.output_dir, format!("{}.%(ext)s", request.base_name));
    let mut args = vec![
        request.source.clone(),
        "-o".to_string(),
        template,
        "--newline".to_string(),
        "--no-playlist".to_string(),
    ];
    args.extend(cookie_args);

    let quality = request
        .media
        .quality
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty());
    match request.media.kind {
        MediaKind::Audio => {
            args.extend(["-x", "--audio-format", "mp3"].map(String::from));
            if let Some(q) = quality {
                args.push("--audio-quality".to_string());
                args.push(q.to_string());
            }
        }
        MediaKind::Video => {
            let sort = match quality.map(|q| q.trim_end_matches(['p', 'P'])) {
                Some(height) if !height.is_empty() && height.bytes().all(|b| b.is_ascii_digit()) => {
                    format!("res:{height},vcodec:h264,res,acodec:m4a")
                }
                _ => "vcodec:h264,res,acodec:m4a".to_string(),
            };
            args.push("-S".to_string());
            args.push(sort);
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
    }
    args
}

fn remux_args(request: &JobRequest) -> Vec<String> {
    let out = output_path(&request.output_dir, format!("{}.mp4", request.base_name));
    vec![
        "-i".to_string(),
        request.source.clone(),
        "-c".to_string(),
        "copy".to_string(),
        "-bsf:a".to_string(),
        "aac_adtstoasc".to_string(),
        "-y".to_string(),
        out,
    ]
}
