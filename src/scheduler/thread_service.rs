use std::collections::VecDeque;
use std::sync::Mutex;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A host-provided way to run background work, in place of a thread the
/// recycler spawns itself.
pub trait ThreadService: Send + Sync {
    /// Run `job` asynchronously. If the service cannot take it, the job is
    /// handed back and the recycler runs it on the calling thread.
    fn invoke(&self, job: Job) -> Result<(), Job>;
}

/// A thread service that only queues jobs. They run when the owner calls
/// [`DeferredThreadService::run_pending`], which lets tests interleave
/// mutator steps with background work deterministically.
#[derive(Default)]
pub struct DeferredThreadService {
    queue: Mutex<VecDeque<Job>>,
    /// Refuse every job, to exercise the in-thread fallback.
    reject: bool,
}

impl DeferredThreadService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        DeferredThreadService {
            queue: Mutex::new(VecDeque::new()),
            reject: true,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Run queued jobs on the calling thread. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl ThreadService for DeferredThreadService {
    fn invoke(&self, job: Job) -> Result<(), Job> {
        if self.reject {
            return Err(job);
        }
        self.queue.lock().unwrap().push_back(job);
        Ok(())
    }
}
