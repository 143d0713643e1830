//! Blueprint provider capability.
//!
//! Blueprints are pre-defined VM recipes; fetching one may adjust the machine
//! description and attach client-side artifacts (aliases, workspaces) to the
//! launch reply.

use async_trait::async_trait;
use multipassd_common::Result;
use serde::{Deserialize, Serialize};

use crate::machine::VirtualMachineDescription;
use crate::vault::{Query, VMImageInfo};

/// A CLI alias a blueprint wants created on the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasDefinition {
    pub name: String,
    pub instance: String,
    pub command: String,
    pub working_directory: String,
}

/// Client-side artifacts accumulated while expanding a blueprint.
#[derive(Debug, Clone, Default)]
pub struct ClientLaunchData {
    pub aliases_to_be_created: Vec<AliasDefinition>,
    pub workspaces_to_be_created: Vec<String>,
}

#[async_trait]
pub trait BlueprintProvider: Send + Sync {
    /// Expand the named blueprint into `desc`, returning the image query to
    /// fetch. Fails with `ImageNotFound` when no such blueprint exists.
    async fn fetch_blueprint_for(
        &self,
        name: &str,
        desc: &mut VirtualMachineDescription,
        launch_data: &mut ClientLaunchData,
    ) -> Result<Query>;

    /// Info for the named blueprint, or `None` when it is not a blueprint.
    async fn info_for(&self, name: &str) -> Result<Option<VMImageInfo>>;

    /// Info for every published blueprint.
    async fn all_blueprints(&self) -> Result<Vec<VMImageInfo>>;

    /// The instance name the blueprint suggests, or empty when `name` is not
    /// a blueprint.
    fn name_from_blueprint(&self, name: &str) -> String;

    /// Blueprint-specific launch timeout in seconds; zero when unset.
    fn blueprint_timeout(&self, name: &str) -> i32;
}
