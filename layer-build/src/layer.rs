//! The five build layers and everything that differs between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::environment::EnvError;

/// A build layer. The derived ordering is the build chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
    Oss,
    Vendor,
    Middleware,
    Application,
    ImageAssembler,
}

impl Layer {
    pub const ALL: [Layer; 5] = [
        Layer::Oss,
        Layer::Vendor,
        Layer::Middleware,
        Layer::Application,
        Layer::ImageAssembler,
    ];

    pub fn name(self) -> &'static str {
        self.profile().name
    }

    /// Upper-case form used in environment and BitBake variable names.
    pub fn key(self) -> String {
        self.name().to_uppercase().replace('-', "_")
    }

    /// BitBake variable pointing downstream builds at this layer's feed.
    pub fn feed_key(self) -> String {
        format!("{}_IPK_SERVER_PATH", self.key())
    }

    /// Layers to build, in order, to obtain this one.
    pub fn chain(self) -> Vec<Layer> {
        Layer::ALL.into_iter().filter(|l| *l <= self).collect()
    }

    /// Layers strictly before this one.
    pub fn predecessors(self) -> Vec<Layer> {
        Layer::ALL.into_iter().filter(|l| *l < self).collect()
    }

    pub fn profile(self) -> &'static LayerProfile {
        &PROFILES[self as usize]
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layer {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layer::ALL
            .into_iter()
            .find(|l| l.name() == s.trim())
            .ok_or_else(|| EnvError::UnknownLayer(s.to_string()))
    }
}

/// Which requested branch a layer's manifest is checked out at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSource {
    Oss,
    Manifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    /// Architecture-only machine, shared by all boards of an architecture.
    Arch,
    /// Full board and variant machine.
    Board,
}

/// Builtin defaults and behaviour switches of one layer.
#[derive(Debug)]
pub struct LayerProfile {
    pub layer: Layer,
    pub name: &'static str,
    pub package: &'static str,
    pub branch: BranchSource,
    pub machine: MachineKind,
    pub publishes_feed: bool,
    pub generates_index: bool,
    pub manifest_url: &'static str,
    pub manifest_file: &'static str,
    /// Subdirectory that only exists once this layer's sources are checked out.
    pub checkout_marker: &'static str,
    /// Directory holding the `<layer>-ipk-feed.inc` files of earlier layers.
    pub include_dir: &'static str,
}

static PROFILES: [LayerProfile; 5] = [
    LayerProfile {
        layer: Layer::Oss,
        name: "oss",
        package: "packagegroup-oss-layer",
        branch: BranchSource::Oss,
        machine: MachineKind::Arch,
        publishes_feed: true,
        generates_index: true,
        manifest_url: "https://github.com/rdkcentral/rdke-oss-manifest",
        manifest_file: "rdk-arm.xml",
        checkout_marker: "rdke/common/meta-oss-reference-release",
        include_dir: "rdke/common/meta-oss-reference-release/conf/include",
    },
    LayerProfile {
        layer: Layer::Vendor,
        name: "vendor",
        package: "lib32-packagegroup-vendor-layer",
        branch: BranchSource::Manifest,
        machine: MachineKind::Board,
        publishes_feed: true,
        generates_index: false,
        manifest_url: "https://github.com/rdkcentral/vendor-manifest-raspberrypi",
        manifest_file: "rdke-raspberrypi.xml",
        checkout_marker: "rdke/vendor/meta-vendor-release",
        include_dir: "rdke/vendor/meta-vendor-release/conf/include",
    },
    LayerProfile {
        layer: Layer::Middleware,
        name: "middleware",
        package: "lib32-packagegroup-middleware-layer",
        branch: BranchSource::Manifest,
        machine: MachineKind::Board,
        publishes_feed: true,
        generates_index: false,
        manifest_url: "https://github.com/rdkcentral/middleware-manifest-rdke",
        manifest_file: "rdke-raspberrypi.xml",
        checkout_marker: "rdke/middleware/meta-middleware-release",
        include_dir: "rdke/middleware/meta-middleware-release/conf/include",
    },
    LayerProfile {
        layer: Layer::Application,
        name: "application",
        package: "lib32-packagegroup-application-layer",
        branch: BranchSource::Manifest,
        machine: MachineKind::Board,
        publishes_feed: true,
        generates_index: false,
        manifest_url: "https://github.com/rdkcentral/application-manifest-rdke",
        manifest_file: "rdke-raspberrypi.xml",
        checkout_marker: "rdke/application/meta-application-release",
        include_dir: "rdke/application/meta-application-release/conf/include",
    },
    LayerProfile {
        layer: Layer::ImageAssembler,
        name: "image-assembler",
        package: "lib32-rdk-fullstack-image",
        branch: BranchSource::Manifest,
        machine: MachineKind::Board,
        publishes_feed: false,
        generates_index: false,
        manifest_url: "https://github.com/rdkcentral/image-assembler-manifest-rdke",
        manifest_file: "rdke-raspberrypi.xml",
        checkout_marker: "rdke/image-assembler/meta-image-assembler-release",
        include_dir: "rdke/image-assembler/meta-image-assembler-release/conf/include",
    },
];

/// Machine names of a target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub arch_machine: String,
    pub board_machine: String,
}

impl Platform {
    pub fn builtin(name: &str) -> Option<Platform> {
        match name {
            "raspberrypi4-64" => Some(Platform {
                name: name.to_string(),
                arch_machine: "rdk-arm64".to_string(),
                board_machine: "raspberrypi4-64-rdke".to_string(),
            }),
            _ => None,
        }
    }

    pub fn machine(&self, kind: MachineKind) -> &str {
        match kind {
            MachineKind::Arch => &self.arch_machine,
            MachineKind::Board => &self.board_machine,
        }
    }
}
