//! Periodic checkpoint and cleaning threads.

use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error};

use crate::{
    common::{LfsError, LfsResult},
    fs::NaiveFs,
};

/// Running background threads. Dropping it stops and joins them.
pub struct BackgroundWorkers {
    stop: Vec<mpsc::Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

fn spawn_loop(
    name: &str,
    interval: Duration,
    fs: Arc<NaiveFs>,
    job: fn(&NaiveFs) -> LfsResult<()>,
) -> LfsResult<(mpsc::Sender<()>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<()>();
    let label = String::from(name);
    let handle = thread::Builder::new()
        .name(label.clone())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = job(&fs) {
                        error!("{} pass failed: {}", label, e);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("{} thread stopping", label);
                    break;
                }
            }
        })
        .map_err(|e| {
            error!("failed to spawn {} thread: {}", name, e);
            LfsError::Io
        })?;
    Ok((tx, handle))
}

impl NaiveFs {
    /// Starts the checkpoint and cleaning threads at the configured
    /// intervals.
    pub fn spawn_background(self: &Arc<Self>) -> LfsResult<BackgroundWorkers> {
        let config = self.config();
        let jobs: [(&str, u64, fn(&NaiveFs) -> LfsResult<()>); 2] = [
            ("naivefs-checkpoint", config.checkpoint_interval_ms, NaiveFs::checkpoint),
            ("naivefs-gc", config.gc_interval_ms, |fs| fs.collect_garbage().map(|_| ())),
        ];
        let mut workers = BackgroundWorkers {
            stop: Vec::new(),
            threads: Vec::new(),
        };
        for (name, ms, job) in jobs {
            let (tx, handle) = spawn_loop(name, Duration::from_millis(ms), self.clone(), job)?;
            workers.stop.push(tx);
            workers.threads.push(handle);
        }
        Ok(workers)
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        for tx in self.stop.drain(..) {
            let _ = tx.send(());
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("background thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::OpenFlags,
        config::LfsConfig,
        device::MemDisk,
        test_util::{fixed_clock, small_config},
    };

    #[test]
    fn checkpoint_thread_advances_version_and_stops() {
        let config = LfsConfig {
            checkpoint_interval_ms: 10,
            gc_interval_ms: 10,
            ..small_config()
        };
        let disk = Arc::new(MemDisk::new(1 << 20));
        let fs = Arc::new(NaiveFs::mount_with_clock(disk, config, fixed_clock).unwrap());
        let workers = fs.spawn_background().unwrap();
        let fd = fs.open("/f", OpenFlags::CREATE).unwrap();
        fs.write(fd, b"data", 0).unwrap();
        let start = std::time::Instant::now();
        while fs.checkpoint_version() < 2 {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(5));
        }
        drop(workers);
        let version = fs.checkpoint_version();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fs.checkpoint_version(), version);
    }
}
