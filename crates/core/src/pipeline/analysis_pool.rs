use std::path::Path;

use crate::pipeline::frame_worker::{FrameRecord, FrameWorker};

type SendError = Box<dyn std::error::Error + Send + Sync>;

/// Builds one fresh [`FrameWorker`] per chunk; called from worker threads.
pub type WorkerFactory = dyn Fn() -> Result<FrameWorker, SendError> + Send + Sync;

/// Splits a video into contiguous chunks and analyzes them on parallel
/// worker threads.
///
/// Each chunk gets its own worker with its own video handle and engine
/// instance; nothing is shared across workers. Results are merged in
/// frame order. When any chunk fails, the error from the lowest-numbered
/// failing chunk is reported.
pub struct AnalysisPool {
    workers: usize,
}

impl AnalysisPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn analyze(
        &self,
        path: &Path,
        total_frames: usize,
        make_worker: &WorkerFactory,
    ) -> Result<Vec<FrameRecord>, Box<dyn std::error::Error>> {
        let chunks = if total_frames == 0 {
            log::warn!("frame count unknown; analyzing in a single chunk");
            vec![(0, usize::MAX)]
        } else {
            plan_chunks(total_frames, self.workers)
        };

        log::info!(
            "analyzing {:?} in {} chunk(s) on {} worker(s)",
            path,
            chunks.len(),
            self.workers
        );

        let mut chunk_results: Vec<Option<Vec<FrameRecord>>> = Vec::new();
        chunk_results.resize_with(chunks.len(), || None);
        let mut first_error: Option<(usize, SendError)> = None;

        let (tx, rx) = crossbeam_channel::bounded::<(usize, Result<Vec<FrameRecord>, SendError>)>(
            chunks.len(),
        );

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(chunks.len());
            for (chunk_index, &(start, end)) in chunks.iter().enumerate() {
                let tx = tx.clone();
                handles.push(scope.spawn(move || {
                    let result = make_worker().and_then(|mut worker| {
                        worker
                            .process_chunk(path, start, end)
                            .map_err(|e| -> SendError { e.to_string().into() })
                    });
                    let _ = tx.send((chunk_index, result));
                }));
            }
            drop(tx);

            for (chunk_index, result) in rx {
                match result {
                    Ok(records) => {
                        log::info!(
                            "chunk {}/{} finished ({} frames)",
                            chunk_index + 1,
                            chunks.len(),
                            records.len()
                        );
                        chunk_results[chunk_index] = Some(records);
                    }
                    Err(e) => {
                        log::warn!("chunk {}/{} failed: {e}", chunk_index + 1, chunks.len());
                        let earlier = match &first_error {
                            Some((i, _)) => chunk_index < *i,
                            None => true,
                        };
                        if earlier {
                            first_error = Some((chunk_index, e));
                        }
                    }
                }
            }

            for handle in handles {
                if handle.join().is_err() && first_error.is_none() {
                    first_error = Some((usize::MAX, "worker thread panicked".into()));
                }
            }
        });

        if let Some((_, e)) = first_error {
            return Err(e.to_string().into());
        }

        Ok(chunk_results.into_iter().flatten().flatten().collect())
    }
}

/// Splits `[0, total_frames)` into up to `workers` contiguous chunks of
/// near-equal length; earlier chunks absorb the remainder.
fn plan_chunks(total_frames: usize, workers: usize) -> Vec<(usize, usize)> {
    if total_frames == 0 {
        return Vec::new();
    }

    let count = workers.min(total_frames).max(1);
    let base = total_frames / count;
    let remainder = total_frames % count;

    let mut chunks = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let len = base + usize::from(i < remainder);
        chunks.push((start, start + len));
        start += len;
    }
    chunks
}
