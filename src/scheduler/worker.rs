//! Persistent threads owned by the recycler: the background collection thread
//! and the parallel mark helpers. Each waits on its work-ready event, runs one
//! job, and signals its work-done event. A job that panics still signals, and
//! the panic is raised again on the thread that waits for it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::event::AutoResetEvent;
use super::thread_service::{Job, ThreadService};

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Run `job`, keeping its panic instead of unwinding the calling thread.
fn run_job(job: Job, panicked: &Mutex<Option<PanicPayload>>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!("Background job panicked");
        *panicked.lock().unwrap() = Some(payload);
    }
}

/// Raise the panic of the job just waited for, if it had one.
fn rethrow(panicked: &Mutex<Option<PanicPayload>>) {
    let payload = panicked.lock().unwrap().take();
    if let Some(payload) = payload {
        panic::resume_unwind(payload);
    }
}

struct WorkerShared {
    work_ready: AutoResetEvent,
    work_done: AutoResetEvent,
    job: Mutex<Option<Job>>,
    panicked: Mutex<Option<PanicPayload>>,
    exit: AtomicBool,
}

pub struct WorkerThread {
    name: String,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            work_ready: AutoResetEvent::new(),
            work_done: AutoResetEvent::new(),
            job: Mutex::new(None),
            panicked: Mutex::new(None),
            exit: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(thread_shared))?;
        debug!("Spawned {}", name);
        Ok(WorkerThread {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    fn run(shared: Arc<WorkerShared>) {
        loop {
            shared.work_ready.wait(None);
            if shared.exit.load(Ordering::Acquire) {
                return;
            }
            let job = shared.job.lock().unwrap().take();
            if let Some(job) = job {
                run_job(job, &shared.panicked);
            }
            shared.work_done.set();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand one job to the thread. The previous job must have completed.
    pub fn submit(&self, job: Job) {
        let mut slot = self.shared.job.lock().unwrap();
        debug_assert!(slot.is_none(), "{} is still busy", self.name);
        *slot = Some(job);
        drop(slot);
        self.shared.work_ready.set();
    }

    /// Returns false on timeout. Panics if the job panicked.
    pub fn wait_done(&self, timeout: Option<Duration>) -> bool {
        let done = self.shared.work_done.wait(timeout);
        if done {
            rethrow(&self.shared.panicked);
        }
        done
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.work_ready.set();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
    }
}

/// Where background collection work runs.
pub enum BackgroundExecutor {
    Dedicated(WorkerThread),
    Service {
        service: Arc<dyn ThreadService>,
        work_done: Arc<AutoResetEvent>,
        panicked: Arc<Mutex<Option<PanicPayload>>>,
    },
}

impl BackgroundExecutor {
    /// Use the host's thread service if it has one, else spawn a thread.
    /// `None` means background work is unavailable and runs in-thread.
    pub fn new(service: Option<Arc<dyn ThreadService>>) -> Option<Self> {
        match service {
            Some(service) => Some(BackgroundExecutor::Service {
                service,
                work_done: Arc::new(AutoResetEvent::new()),
                panicked: Arc::new(Mutex::new(None)),
            }),
            None => match WorkerThread::spawn("recycler-background") {
                Ok(thread) => Some(BackgroundExecutor::Dedicated(thread)),
                Err(e) => {
                    warn!("Unable to start the background thread: {}", e);
                    None
                }
            },
        }
    }

    /// Start `job` in the background. On failure the job is handed back.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        match self {
            BackgroundExecutor::Dedicated(thread) => {
                thread.submit(job);
                Ok(())
            }
            BackgroundExecutor::Service {
                service,
                work_done,
                panicked,
            } => {
                // The job is wrapped, so a rejected one has to be rebuilt by
                // the caller. Keep the original reachable through a shared slot.
                let slot: Arc<Mutex<Option<Job>>> = Arc::new(Mutex::new(Some(job)));
                let job_slot = slot.clone();
                let done = work_done.clone();
                let panicked = panicked.clone();
                let wrapped: Job = Box::new(move || {
                    let job = job_slot.lock().unwrap().take();
                    if let Some(job) = job {
                        run_job(job, &panicked);
                    }
                    done.set();
                });
                match service.invoke(wrapped) {
                    Ok(()) => Ok(()),
                    Err(_) => match slot.lock().unwrap().take() {
                        Some(job) => Err(job),
                        None => Ok(()),
                    },
                }
            }
        }
    }

    pub fn wait_done(&self, timeout: Option<Duration>) -> bool {
        match self {
            BackgroundExecutor::Dedicated(thread) => thread.wait_done(timeout),
            BackgroundExecutor::Service {
                work_done, panicked, ..
            } => {
                let done = work_done.wait(timeout);
                if done {
                    rethrow(panicked);
                }
                done
            }
        }
    }
}
