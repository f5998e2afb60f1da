//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use backbone::{Backbone, BackboneConfig, BlockKind, ResNetInit};
pub use filter_prune::{BlockPruner, CutRatio, FilterRanker, PruneReport};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
pub use tch::{nn, Cuda, Device};

pub type Fallible<T> = Result<T, Error>;
