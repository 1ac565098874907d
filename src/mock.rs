//! Mock bulb for testing.
//!
//! [`MockBulb`] stands in for a real bulb behind a [`DeviceSession`]: it
//! keeps a data-point map, records every write and can be told to fail
//! the next operations.
//!
//! ```
//! use tuya_bulb_panel::mock::MockBulb;
//! use tuya_bulb_panel::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bulb = MockBulb::new();
//!     let config: Config = r#"
//!         [bulb]
//!         device_id = "mock"
//!         ip_address = "127.0.0.1"
//!         local_key = "0123456789abcdef"
//!         version = 3.3
//!     "#.parse().unwrap();
//!     let session = DeviceSession::new(config.bulb, SessionOptions::default(), bulb.connector());
//!
//!     session.connect().await.unwrap();
//!     session.set_power(false).await.unwrap();
//!     assert_eq!(bulb.writes().len(), 1);
//! }
//! ```
//!
//! [`DeviceSession`]: crate::DeviceSession

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::BulbConfig;
use crate::session::{Connector, DeviceLink, SessionOptions};
use crate::state::Dps;
use crate::{Error, Result};

/// A failure to inject into the next link operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The bulb does not answer
    Timeout,
    /// The bulb answers with garbage
    Malformed,
    /// The socket is closed under us
    Disconnect,
}

#[derive(Debug, Default)]
struct MockInner {
    dps: Dps,
    writes: Vec<Dps>,
    failures: VecDeque<MockFailure>,
    connects: u32,
    status_queries: u32,
    refuse: bool,
}

/// Shared state of a simulated bulb
#[derive(Debug, Clone, Default)]
pub struct MockBulb {
    inner: Arc<Mutex<MockInner>>,
}

impl MockBulb {
    /// A bulb that is on, in white mode, at full brightness.
    pub fn new() -> Self {
        Self::with_dps(json!({"20": true, "21": "white", "22": 1000, "23": 500}))
    }

    /// A bulb reporting the given data points. Non-objects give an empty map.
    pub fn with_dps(dps: Value) -> Self {
        let bulb = Self::default();
        bulb.inner.lock().dps = dps.as_object().cloned().unwrap_or_default();
        bulb
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector { bulb: self.clone() }
    }

    /// Queues a failure for the next link operation.
    pub fn fail_next(&self, failure: MockFailure) {
        self.inner.lock().failures.push_back(failure);
    }

    /// Makes connection attempts fail until switched off again.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Every write received, in order.
    pub fn writes(&self) -> Vec<Dps> {
        self.inner.lock().writes.clone()
    }

    /// Current data points.
    pub fn dps(&self) -> Dps {
        self.inner.lock().dps.clone()
    }

    /// Number of connection attempts.
    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }

    /// Number of status queries received.
    pub fn status_queries(&self) -> u32 {
        self.inner.lock().status_queries
    }

    fn take_failure(&self) -> Result<()> {
        match self.inner.lock().failures.pop_front() {
            None => Ok(()),
            Some(MockFailure::Timeout) => Err(Error::Timeout(Duration::from_secs(5))),
            Some(MockFailure::Malformed) => Err(Error::MalformedResponse(
                "mock bulb sent garbage".to_string(),
            )),
            Some(MockFailure::Disconnect) => Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "mock bulb hung up",
            ))),
        }
    }
}

/// Opens [`MockLink`]s to a [`MockBulb`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    bulb: MockBulb,
}

#[async_trait]
impl Connector for MockConnector {
    type Link = MockLink;

    async fn connect(&self, config: &BulbConfig, options: &SessionOptions) -> Result<MockLink> {
        let mut inner = self.bulb.inner.lock();

        inner.connects += 1;
        if inner.refuse {
            return Err(Error::Connect {
                addr: config.endpoint(options.port),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(MockLink {
            bulb: self.bulb.clone(),
        })
    }
}

/// A link to a [`MockBulb`]
#[derive(Debug)]
pub struct MockLink {
    bulb: MockBulb,
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn status(&mut self) -> Result<Dps> {
        self.bulb.inner.lock().status_queries += 1;
        self.bulb.take_failure()?;
        Ok(self.bulb.dps())
    }

    async fn set_dps(&mut self, dps: Dps) -> Result<()> {
        self.bulb.take_failure()?;

        let mut inner = self.bulb.inner.lock();

        inner.writes.push(dps.clone());
        inner.dps.extend(dps);
        Ok(())
    }
}
