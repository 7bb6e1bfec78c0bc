#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;

use fleet_supervisor::node::Node;
use fleet_supervisor::provisioner::{NodeProvisioner, ProvisionerError};

/// In-memory recorder used in place of a real provisioner backend. Records
/// every `start`/`terminate` call by node id and lets tests script which
/// node ids should fail, and whether that failure is terminal.
#[derive(Default)]
pub struct MockProvisioner {
    pub started: Mutex<Vec<i64>>,
    pub terminated: Mutex<Vec<i64>>,
    fail_start: Mutex<HashSet<i64>>,
    fail_start_terminal: Mutex<HashSet<i64>>,
    fail_terminate: Mutex<HashSet<i64>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start_for(&self, node_id: i64, terminal: bool) {
        self.fail_start.lock().unwrap().insert(node_id);
        if terminal {
            self.fail_start_terminal.lock().unwrap().insert(node_id);
        }
    }

    pub fn fail_terminate_for(&self, node_id: i64) {
        self.fail_terminate.lock().unwrap().insert(node_id);
    }

    pub fn started_ids(&self) -> Vec<i64> {
        self.started.lock().unwrap().clone()
    }

    pub fn terminated_ids(&self) -> Vec<i64> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl NodeProvisioner for MockProvisioner {
    async fn start(&self, node: &Node) -> Result<(), ProvisionerError> {
        self.started.lock().unwrap().push(node.id);
        if self.fail_start.lock().unwrap().contains(&node.id) {
            let terminal = self.fail_start_terminal.lock().unwrap().contains(&node.id);
            return Err(ProvisionerError::Start {
                message: "mock start failure".into(),
                terminal,
            });
        }
        Ok(())
    }

    async fn terminate(&self, node: &Node) -> Result<(), ProvisionerError> {
        self.terminated.lock().unwrap().push(node.id);
        if self.fail_terminate.lock().unwrap().contains(&node.id) {
            return Err(ProvisionerError::Terminate {
                message: "mock terminate failure".into(),
            });
        }
        Ok(())
    }
}
