#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use guardian_tss::simulation::{test_guardians_with_config, MockFullParty, Simulation};
use guardian_tss::{delivery, Configurations, Engine, EngineBuilder, SignatureData};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Guardians connected through in-memory network
pub struct Network {
    pub engines: Vec<Engine>,
    pub signatures: Vec<mpsc::Receiver<SignatureData>>,
    pub shutdown: CancellationToken,
}

impl Network {
    pub fn spawn(n: usize, threshold: usize) -> Self {
        Self::spawn_with_config(n, threshold, Configurations::default())
    }

    pub fn spawn_with_config(n: usize, threshold: usize, config: Configurations) -> Self {
        let shutdown = CancellationToken::new();
        let network = Simulation::with_capacity(4096);

        let mut engines = vec![];
        let mut signatures = vec![];
        for storage in test_guardians_with_config(n, threshold, config).unwrap() {
            let full_party = Arc::new(MockFullParty::new(&storage));
            let connection = network.connect(storage.me().clone());
            let engine = EngineBuilder::new(storage)
                .full_party(full_party)
                .build()
                .unwrap();
            engine.start(shutdown.clone()).unwrap();
            signatures.push(engine.produced_signatures().unwrap());
            tokio::spawn(delivery::run(engine.clone(), connection, shutdown.clone()));
            engines.push(engine);
        }

        Self {
            engines,
            signatures,
            shutdown,
        }
    }

    /// Waits for the next signature produced by guardian `i`
    pub async fn next_signature(&mut self, i: usize) -> SignatureData {
        tokio::time::timeout(TIMEOUT, self.signatures[i].recv())
            .await
            .expect("signature wasn't produced in time")
            .expect("signatures channel is closed")
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown.cancel()
    }
}
