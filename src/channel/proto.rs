//! Anti-entropy wire messages.
//!
//! One session exchanges exactly four messages:
//! advertisement, id list, delta, delta. See [`crate::session`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeInfo, NodeMetaInfo};

/// Step 1: the initiator's full per-node metadata view. `sender_id`
/// lets the responder attribute the session for liveness accounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub version: String,
    pub cluster_id: String,
    pub sender_id: NodeId,
    pub meta_infos: Vec<NodeMetaInfo>,
}

/// Step 2: ids for which the receiving side wants full records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdList(pub Vec<NodeId>);

/// Steps 3 and 4: the full records for a set of ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta(pub BTreeMap<NodeId, NodeInfo>);
