pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use itertools::Itertools;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
    mem,
    path::Path,
};
pub use strum::AsRefStr;
pub use tch::{
    nn::{self, Module as _, ModuleT as _},
    Device, Kind, Tensor,
};

pub type Fallible<T> = Result<T, Error>;
