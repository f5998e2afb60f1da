pub use crate::error::PruneError;
pub use anyhow::{ensure, format_err, Error, Result};
pub use approx::AbsDiffEq;
pub use backbone::{
    Backbone, BatchNorm2D, BatchNormParams, BlockKind, Conv2D, LayerRef, Node, Slot,
};
pub use itertools::Itertools;
pub use log::debug;
pub use noisy_float::prelude::*;
pub use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    collections::{BTreeSet, BinaryHeap, HashMap},
    convert::{TryFrom, TryInto},
    fmt::{self, Display, Formatter},
};
pub use tch::{Device, Kind, TchError, Tensor};

pub type PruneResult<T> = Result<T, PruneError>;
