use futures::StreamExt;
use futures::stream;
use tracing::debug;

use crate::fileset::FileSet;
use crate::spec::DestinationSpec;
use crate::transfer::{DestinationReport, TransferOptions, TransferRequest, transfer_with};
use crate::transport::Connector;
use crate::Result;

/// Result for one destination of a batch, in input order.
#[derive(Debug)]
pub struct DispatchEntry {
    pub destination: DestinationSpec,
    pub result: Result<DestinationReport>,
}

impl DispatchEntry {
    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_ok_and(DestinationReport::is_success)
    }
}

pub async fn dispatch_all(
    connector: &dyn Connector,
    files: &FileSet,
    destinations: &[DestinationSpec],
) -> Vec<DispatchEntry> {
    dispatch_all_with(connector, files, destinations, TransferOptions::default(), 1).await
}

/// Sends `files` to every destination and returns one entry per destination
/// in the order given.
///
/// With `max_parallel > 1` up to that many destinations run at once, each on
/// its own session and progress state. A failing destination never stops the
/// others.
pub async fn dispatch_all_with(
    connector: &dyn Connector,
    files: &FileSet,
    destinations: &[DestinationSpec],
    options: TransferOptions<'_>,
    max_parallel: usize,
) -> Vec<DispatchEntry> {
    let max_parallel = max_parallel.max(1);
    debug!(
        event = "batch.start",
        destinations = destinations.len(),
        files = files.len(),
        max_parallel,
        "batch.start"
    );

    let entries: Vec<DispatchEntry> = stream::iter(destinations.iter().enumerate())
        .map(|(position, destination)| async move {
            let request = TransferRequest {
                destination: destination.clone(),
                files: files.clone(),
            };
            let result = transfer_with(connector, &request, options).await;
            debug!(
                event = "batch.destination_done",
                position = position + 1,
                destination = %destination.label(),
                ok = result.is_ok(),
                "batch.destination_done"
            );
            DispatchEntry {
                destination: destination.clone(),
                result,
            }
        })
        .buffered(max_parallel)
        .collect()
        .await;

    let failed = entries.iter().filter(|e| !e.is_success()).count();
    debug!(
        event = "batch.finish",
        destinations = entries.len(),
        failed,
        "batch.finish"
    );
    entries
}
