use std::sync::Arc;

use tracing::{info, warn};

use super::{EngineError, SeedEngine};
use crate::source::{ByteStream, SourceRequest};
use crate::storage::PieceRange;
use crate::task::SeedTask;

/// Opens a streaming read of the task's origin resource starting at
/// `break_point`, applying the declared range (if any) as an offset, and
/// persists the origin's cache validators.
pub(super) async fn download(
    engine: &Arc<SeedEngine>,
    task: &SeedTask,
    break_point: u64,
) -> Result<ByteStream, EngineError> {
    let client = engine
        .clients
        .for_url(&task.raw_url)
        .map_err(EngineError::Source)?;

    let mut request = SourceRequest::new(&task.raw_url).with_header(task.headers.clone());
    if let Some(range) = break_range(break_point, &task.range, task.source_file_length)? {
        request = request.with_range(range);
    }
    info!(
        task_id = %task.id,
        url = %task.raw_url,
        break_point,
        declared_range = %task.range,
        "start origin download"
    );

    let (stream, expire_info) = client
        .download_with_expire_info(&request)
        .await
        .map_err(|err| EngineError::DownloadFail(err.to_string()))?;

    if let Err(err) = engine
        .metadata()
        .update_expire_info(&task.id, expire_info.into_map())
        .await
    {
        warn!(task_id = %task.id, %err, "persist expire info");
    }
    Ok(stream)
}

/// Effective request range for a resumed fetch.
///
/// The declared task range is a subrange of the origin resource and the
/// task's source length is the length of that range, so the break point is
/// an offset inside it. Returns `None` for an unranged fetch from zero.
fn break_range(
    break_point: u64,
    declared_range: &str,
    source_file_length: i64,
) -> Result<Option<String>, EngineError> {
    if declared_range.is_empty() {
        if break_point == 0 {
            return Ok(None);
        }
        return Ok(Some(format!("{break_point}-")));
    }
    let declared: PieceRange = declared_range
        .parse()
        .map_err(|_| EngineError::DownloadFail(format!("invalid declared range: {declared_range}")))?;
    if source_file_length >= 0 && declared.length() != source_file_length as u64 {
        return Err(EngineError::Inconsistent(format!(
            "declared range {declared_range} does not cover source length {source_file_length}"
        )));
    }
    Ok(Some(format!(
        "{}-{}",
        declared.start + break_point,
        declared.end
    )))
}
