pub use anyhow::{Context, Result, anyhow, bail};
pub use itertools::Itertools;
pub use log::{debug, error, info, trace, warn};
