use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use super::{Intake, PeerAddressSource};
use crate::metainfo::InfoHash;

/// Dials addresses from a [`PeerAddressSource`], with at most `limit`
/// negotiations running.
pub struct Dialer<S> {
    intake: Intake,
    source: Arc<S>,
    info_hash: InfoHash,
    limit: Arc<Semaphore>,
}

impl<S: PeerAddressSource> Dialer<S> {
    /// Creates a dialer for the swarm of `info_hash`.
    pub fn new(intake: Intake, source: Arc<S>, info_hash: InfoHash, limit: usize) -> Self {
        Self {
            intake,
            source,
            info_hash,
            limit: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Dials until stopped or the source closes.
    pub async fn run(self) {
        let stop = self.intake.stop.clone();
        let mut negotiations = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let addr = tokio::select! {
                _ = stop.cancelled() => break,
                addr = self.source.next() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };

            let intake = self.intake.clone();
            let info_hash = self.info_hash;
            negotiations.spawn(async move {
                let _permit = permit;
                let result = tokio::select! {
                    result = intake.negotiator.dial(addr, &info_hash) => result,
                    _ = intake.stop.cancelled() => return,
                };
                match result {
                    Ok(negotiated) => intake.deliver(negotiated, addr, "->").await,
                    Err(e) => debug!("peer -> {}: handshake failed: {}", addr, e),
                }
            });

            while negotiations.try_join_next().is_some() {}
        }

        while negotiations.join_next().await.is_some() {}
        debug!("dialer stopped");
    }
}
