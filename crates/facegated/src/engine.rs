use facegate_core::{Enrollment, FaceError, FaceService, MatchDecision};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("request timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, FaceError>>;

/// Messages sent from HTTP handlers to the engine thread.
///
/// Only requests that run the extractor or mutate the store go through the
/// engine; listing and counting read the store directly.
enum EngineRequest {
    Enroll { key: String, image: String, reply: Reply<Enrollment> },
    Verify { key: String, image: String, reply: Reply<MatchDecision> },
    Identify { image: String, reply: Reply<MatchDecision> },
    Remove { key: String, reply: Reply<bool> },
}

impl EngineRequest {
    fn name(&self) -> &'static str {
        match self {
            EngineRequest::Enroll { .. } => "enroll",
            EngineRequest::Verify { .. } => "verify",
            EngineRequest::Identify { .. } => "identify",
            EngineRequest::Remove { .. } => "remove",
        }
    }

    /// The caller stopped waiting (timeout or dropped connection).
    fn is_abandoned(&self) -> bool {
        match self {
            EngineRequest::Enroll { reply, .. } => reply.is_closed(),
            EngineRequest::Verify { reply, .. } => reply.is_closed(),
            EngineRequest::Identify { reply, .. } => reply.is_closed(),
            EngineRequest::Remove { reply, .. } => reply.is_closed(),
        }
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    pub async fn enroll(&self, key: String, image: String) -> Result<Enrollment, EngineError> {
        self.call(|reply| EngineRequest::Enroll { key, image, reply }).await
    }

    pub async fn verify(&self, key: String, image: String) -> Result<MatchDecision, EngineError> {
        self.call(|reply| EngineRequest::Verify { key, image, reply }).await
    }

    pub async fn identify(&self, image: String) -> Result<MatchDecision, EngineError> {
        self.call(|reply| EngineRequest::Identify { image, reply }).await
    }

    pub async fn remove(&self, key: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Remove { key, reply }).await
    }

    /// Queue a request and wait for its reply, bounded by the request timeout.
    ///
    /// On timeout the reply channel is dropped. The engine skips the request
    /// if it has not started yet, and an enrollment is discarded before commit.
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(make(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
            result.map_err(EngineError::Face)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns `service` and handles one request at a time, so store
/// mutations never interleave. It exits once every handle is dropped.
pub fn spawn_engine(
    mut service: FaceService,
    queue_depth: usize,
    timeout: Duration,
) -> std::io::Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!(extractor = service.descriptor(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.is_abandoned() {
                    tracing::info!(request = req.name(), "skipping abandoned request");
                    continue;
                }
                handle(&mut service, req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

fn handle(service: &mut FaceService, req: EngineRequest) {
    // Send errors mean the caller gave up meanwhile; nothing to do.
    match req {
        EngineRequest::Enroll { key, image, reply } => {
            let staged = match service.stage_enrollment(&key, &image) {
                Ok(staged) => staged,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            };
            if reply.is_closed() {
                // Dropping the stage deletes it; the previous reference stays.
                tracing::info!(key = %key, "enrollment abandoned before commit; discarded");
                return;
            }
            let _ = reply.send(service.commit_enrollment(staged));
        }
        EngineRequest::Verify { key, image, reply } => {
            let _ = reply.send(service.verify(&key, &image));
        }
        EngineRequest::Identify { image, reply } => {
            let _ = reply.send(service.identify(&image));
        }
        EngineRequest::Remove { key, reply } => {
            let _ = reply.send(service.remove(&key));
        }
    }
}
