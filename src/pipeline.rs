//! Wires the Stream Queues to their workers and watches the worker threads.

use log::{error, info, warn};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::queue::{stream_queue, QueueReceiver};
use crate::router::Router;
use crate::services::{archiver, flusher};
use crate::services::flusher::{FlushSettings, WriteBatch};
use crate::store::Connect;
use crate::utils::StopSignal;

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub flush: FlushSettings,
    pub history_bucket_secs: u32,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        PipelineSettings {
            queue_capacity: cfg.queue_capacity,
            flush: FlushSettings {
                batch_size: cfg.batch_size,
                flush_interval: cfg.flush_interval,
                reconnect_backoff: cfg.reconnect_backoff,
            },
            history_bucket_secs: cfg.history_bucket_secs,
        }
    }
}

pub struct Pipeline {
    pub router: Router,
    stop: StopSignal,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Creates every queue and starts one flusher per queue plus the archiver.
    pub fn start<C>(settings: PipelineSettings, connector: C, stop: StopSignal) -> Result<Self, String>
    where
        C: Connect + Clone,
    {
        let cap = settings.queue_capacity;
        let (realtime_tx, realtime_rx) = stream_queue("realtime", cap);
        let (history_tx, history_rx) = stream_queue("history", cap);
        let (alarm_tx, alarm_rx) = stream_queue("alarm", cap);
        let (archive_tx, archive_rx) = stream_queue("archive", cap);
        let (para_tx, para_rx) = stream_queue("para", cap);
        let (ack_tx, ack_rx) = stream_queue("rpc_ack", cap);

        let router = Router {
            realtime: realtime_tx,
            history: history_tx,
            alarm: alarm_tx,
            archive: archive_tx,
            para: para_tx,
            rpc_ack: ack_tx,
            history_bucket_secs: settings.history_bucket_secs,
        };

        let mut pipeline = Pipeline {
            router,
            stop,
            workers: Vec::with_capacity(6),
        };

        let flush = settings.flush;
        pipeline.spawn_flusher(realtime_rx, connector.clone(), flusher::write_realtime, flush)?;
        pipeline.spawn_flusher(history_rx, connector.clone(), flusher::write_history, flush)?;
        pipeline.spawn_flusher(alarm_rx, connector.clone(), flusher::write_alarms, flush)?;
        pipeline.spawn_flusher(para_rx, connector.clone(), flusher::write_params, flush)?;
        pipeline.spawn_flusher(ack_rx, connector.clone(), flusher::write_acks, flush)?;

        let stop = pipeline.stop.clone();
        let handle = thread::Builder::new()
            .name("archiver".to_string())
            .spawn(move || {
                archiver::run(archive_rx, &connector, flush.flush_interval, flush.reconnect_backoff, &stop)
            })
            .map_err(|e| format!("spawning archiver failed: {}", e))?;
        pipeline.workers.push(("archiver", handle));

        info!("Pipeline started with {} worker(s)", pipeline.workers.len());
        Ok(pipeline)
    }

    fn spawn_flusher<C, T>(
        &mut self,
        queue: QueueReceiver<T>,
        connector: C,
        write: WriteBatch<C::Store, T>,
        settings: FlushSettings,
    ) -> Result<(), String>
    where
        C: Connect,
        T: Send + 'static,
    {
        let name = queue.name();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("flush-{}", name))
            .spawn(move || flusher::run(queue, &connector, write, settings, &stop))
            .map_err(|e| format!("spawning flusher {} failed: {}", name, e))?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// Put an externally spawned thread (the bus consumer) under supervision.
    pub fn watch(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.workers.push((name, handle));
    }

    /// Blocks until a stop is requested or a worker dies. A worker that exits on its own
    /// is a fatal condition and raises the stop signal for everyone else.
    pub fn supervise(&self) -> Result<(), String> {
        while !self.stop.is_stopped() {
            if let Some((name, _)) = self.workers.iter().find(|(_, h)| h.is_finished()) {
                if self.stop.is_stopped() {
                    break;
                }
                error!("Worker {} exited unexpectedly; shutting down", name);
                self.stop.stop();
                return Err(format!("worker {} died", name));
            }
            self.stop.sleep(SUPERVISE_INTERVAL);
        }
        Ok(())
    }

    /// Raises the stop signal and joins every worker. Returns the messages each queue
    /// dropped on overload.
    pub fn shutdown(self) -> Vec<(&'static str, u64)> {
        self.stop.stop();
        let totals = self.drop_totals();
        for (name, handle) in self.workers {
            if handle.join().is_err() {
                warn!("Worker {} panicked", name);
            }
        }
        info!("Pipeline stopped");
        totals
    }

    pub fn drop_totals(&self) -> Vec<(&'static str, u64)> {
        let r = &self.router;
        vec![
            (r.realtime.name(), r.realtime.dropped()),
            (r.history.name(), r.history.dropped()),
            (r.alarm.name(), r.alarm.dropped()),
            (r.archive.name(), r.archive.dropped()),
            (r.para.name(), r.para.dropped()),
            (r.rpc_ack.name(), r.rpc_ack.dropped()),
        ]
    }
}
