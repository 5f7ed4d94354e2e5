pub use std::convert::{TryFrom, TryInto};
pub use std::fmt::Display;
pub use std::io::{Read, Seek, Write};

pub use anyhow::{anyhow, bail, Context, Result};
pub use log::{debug, info, trace, warn};
pub use url::Url;

pub use crate::error::ResultCode;
