use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::Intake;
use crate::peer::TorrentLookup;

/// Accepts inbound connections, with at most `limit` negotiations running.
pub struct Acceptor {
    intake: Intake,
    listener: TcpListener,
    lookup: Arc<dyn TorrentLookup>,
    limit: Arc<Semaphore>,
}

impl Acceptor {
    /// Creates an acceptor on an already bound `listener`.
    pub fn new(
        intake: Intake,
        listener: TcpListener,
        lookup: Arc<dyn TorrentLookup>,
        limit: usize,
    ) -> Self {
        Self {
            intake,
            listener,
            lookup,
            limit: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Accepts until stopped. Connections beyond the limit wait in the
    /// listener backlog.
    pub async fn run(self) {
        let stop = self.intake.stop.clone();
        if let Ok(addr) = self.listener.local_addr() {
            info!("accepting peers on {}", addr);
        }
        let mut negotiations = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (stream, addr) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            let intake = self.intake.clone();
            let lookup = Arc::clone(&self.lookup);
            negotiations.spawn(async move {
                let _permit = permit;
                let result = tokio::select! {
                    result = intake.negotiator.incoming(stream, &*lookup) => result,
                    _ = intake.stop.cancelled() => return,
                };
                match result {
                    Ok(negotiated) => intake.deliver(negotiated, addr, "<-").await,
                    Err(e) => debug!("peer <- {}: handshake failed: {}", addr, e),
                }
            });

            // Reap finished negotiations so the set doesn't grow unbounded.
            while negotiations.try_join_next().is_some() {}
        }

        while negotiations.join_next().await.is_some() {}
        debug!("acceptor stopped");
    }
}
