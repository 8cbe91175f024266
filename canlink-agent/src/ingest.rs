// CANLink Agent - Ingestion loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Sequential ingestion loop.
//!
//! Runs on its own thread: the pipeline, the durable queue and the blocking
//! HTTP client all live here. The async side only reads [`AgentStatus`].

use crate::config::AgentConfig;
use crate::error::Result;
use crate::replay::CsvLogParser;
use crate::source::FrameSource;
use crate::status::{AgentStatus, StatusSnapshot};
use crate::uplink::HttpPublisher;
use canlink::fault::FaultDetector;
use canlink::protocol::unix_now;
use canlink::{
    Decoder, DeliveryLayer, DurableQueue, HistoricalLogParser, Pipeline, Publisher, SignalDatabase,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Publish a status snapshot every this many frames
const STATUS_EVERY: u64 = 50;

/// What the loop consumes
pub struct IngestPlan {
    pub config: AgentConfig,
    /// Historical CSV log replayed before live frames
    pub replay_log: Option<PathBuf>,
    pub source: Option<Box<dyn FrameSource + Send>>,
}

/// Build the decoder from the configured signal database, if any.
pub fn build_decoder(config: &AgentConfig) -> Result<Decoder> {
    match &config.signal_database {
        Some(path) => {
            let db = SignalDatabase::from_path(path).map_err(canlink::CanLinkError::from)?;
            info!(
                path = %path.display(),
                frames = db.frame_count(),
                "Loaded signal database"
            );
            Ok(Decoder::with_database(db))
        }
        None => Ok(Decoder::default()),
    }
}

/// Build a pipeline around any publisher.
pub fn build_pipeline<P: Publisher>(config: &AgentConfig, publisher: P) -> Result<Pipeline<P>> {
    let queue = DurableQueue::open(&config.queue_path).map_err(canlink::CanLinkError::from)?;
    let delivery = DeliveryLayer::with_config(publisher, queue, config.pipeline.delivery.clone());
    let detector = FaultDetector::new(config.pipeline.detector.clone())
        .with_persistence(config.model_path());

    Ok(Pipeline::new(config.pipeline.clone(), build_decoder(config)?, delivery)
        .with_detector(detector))
}

/// Replay, then consume live frames until the source ends.
pub fn drive<P: Publisher>(
    pipeline: &mut Pipeline<P>,
    plan: &mut IngestPlan,
    status: &AgentStatus,
) -> Result<()> {
    status.running.store(true, Ordering::SeqCst);
    status.publish(StatusSnapshot::capture(pipeline));

    if let Some(path) = &plan.replay_log {
        let log = CsvLogParser::default().parse(path)?;
        let options = &plan.config.replay;
        if options.train_detector {
            match pipeline.train_detector(&log) {
                Ok(rows) => info!(rows, "Fault detector trained from log"),
                Err(e) => warn!(error = %e, "Could not train fault detector from log"),
            }
        }
        let start = options.start.unwrap_or_else(unix_now);
        let replayed = pipeline.replay(&log, start, options.interval_secs)?;
        info!(records = replayed, "Replay complete");
        status.publish(StatusSnapshot::capture(pipeline));
    }

    let mut skipped = 0;
    if let Some(source) = plan.source.as_mut() {
        while let Some(timed) = source.next_frame()? {
            let now = timed.timestamp.unwrap_or_else(unix_now);
            trace!(interface = %timed.interface, frame = %timed.frame, "Frame");
            pipeline.process_frame(&timed.frame, now)?;
            if pipeline.stats().frames_seen % STATUS_EVERY == 0 {
                status.publish(
                    StatusSnapshot::capture(pipeline).with_skipped_lines(source.skipped()),
                );
            }
        }
        skipped = source.skipped();
        info!(
            frames = pipeline.stats().frames_seen,
            skipped,
            "Frame source exhausted"
        );
    }

    // Last chance to drain anything buffered during the run
    if pipeline.delivery().publisher().is_connected() {
        let flushed = pipeline.delivery_mut().flush_pending().map_err(canlink::CanLinkError::from)?;
        if flushed > 0 {
            info!(flushed, "Final flush");
        }
    }

    status.publish(StatusSnapshot::capture(pipeline).with_skipped_lines(skipped));
    status.finished.store(true, Ordering::SeqCst);
    Ok(())
}

/// Thread entry point: builds the HTTP pipeline and drives it.
pub fn run(mut plan: IngestPlan, status: Arc<AgentStatus>) -> Result<()> {
    let publisher = HttpPublisher::new(plan.config.uplink.clone())?;
    info!(endpoint = %plan.config.uplink.endpoint, "Uplink configured");

    let mut pipeline = build_pipeline(&plan.config, publisher)?;
    info!(
        device_id = %plan.config.pipeline.device_id,
        queue = %plan.config.queue_path.display(),
        backlog = pipeline.delivery().queue_depth().unwrap_or_default(),
        "Pipeline ready"
    );

    let result = drive(&mut pipeline, &mut plan, &status);
    status.running.store(false, Ordering::SeqCst);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CandumpSource;
    use canlink::MemoryPublisher;
    use std::io::{Cursor, Write};

    fn config_in(dir: &std::path::Path) -> AgentConfig {
        let mut config = AgentConfig {
            queue_path: dir.join("outbound.db"),
            ..Default::default()
        };
        config.pipeline.device_id = "bench-rig".to_string();
        config
    }

    #[test]
    fn test_model_path_next_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert_eq!(config.model_path(), dir.path().join("fault-model.json"));
    }

    #[test]
    fn test_drive_candump_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut pipeline = build_pipeline(&config, MemoryPublisher::new()).unwrap();

        let input =
            "(100.0) can0 102#6004\n(105.0) can0 102#6004\ngarbage\n(110.0) can0 7DF#0201\n";
        let mut plan = IngestPlan {
            config,
            replay_log: None,
            source: Some(Box::new(CandumpSource::new(Cursor::new(input.to_string())))),
        };
        let status = AgentStatus::new();
        drive(&mut pipeline, &mut plan, &status).unwrap();

        let snapshot = status.snapshot();
        assert!(status.finished.load(Ordering::SeqCst));
        assert_eq!(snapshot.device_id, "bench-rig");
        assert_eq!(snapshot.pipeline.frames_seen, 3);
        assert_eq!(snapshot.pipeline.frames_decoded, 2);
        assert_eq!(snapshot.pipeline.unknown_frames, 1);
        assert_eq!(snapshot.skipped_lines, 1);
        assert!(snapshot.health_score.is_some());

        let sent = pipeline.delivery().publisher().sent();
        assert!(sent.iter().all(|p| p.contains("\"device_id\":\"bench-rig\"")));
    }

    #[test]
    fn test_drive_replays_csv_log() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("trip.csv");
        let mut file = std::fs::File::create(&csv_path).unwrap();
        writeln!(file, "timestamp,RPM,ECT").unwrap();
        for i in 0..10 {
            writeln!(file, "{},{},{}", i * 1000, 800 + i * 10, 88).unwrap();
        }
        drop(file);

        let mut config = config_in(dir.path());
        config.replay.start = Some(1_700_000_000.0);
        let mut pipeline = build_pipeline(&config, MemoryPublisher::new()).unwrap();
        let mut plan = IngestPlan {
            config,
            replay_log: Some(csv_path),
            source: None,
        };
        let status = AgentStatus::new();
        drive(&mut pipeline, &mut plan, &status).unwrap();

        assert_eq!(pipeline.stats().records_processed, 10);
        assert_eq!(pipeline.stats().readings, 20);
        assert!(pipeline.analytics().window("Engine_RPM").is_some());
    }

    #[test]
    fn test_offline_frames_buffer_durably() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut pipeline = build_pipeline(&config, MemoryPublisher::disconnected()).unwrap();

        let input = "(1.0) can0 102#8403\n(2.0) can0 102#8403\n";
        let mut plan = IngestPlan {
            config: config.clone(),
            replay_log: None,
            source: Some(Box::new(CandumpSource::new(Cursor::new(input.to_string())))),
        };
        let status = AgentStatus::new();
        drive(&mut pipeline, &mut plan, &status).unwrap();
        let depth = status.snapshot().queue_depth;
        assert!(depth >= 2);
        drop(pipeline);

        let reopened = DurableQueue::open(&config.queue_path).unwrap();
        assert_eq!(reopened.len().unwrap(), depth);
    }
}
