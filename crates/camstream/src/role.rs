// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Stream roles and the format → role table.

use std::fmt;

use crate::format::PixelFormat;

/// Purpose of an output stream, which doubles as its stream id.
///
/// A role is resolved once from the requested pixel format when the stream
/// is allocated and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamRole {
    Preview,
    Record,
    Capture,
    Callback,
    Zsl,
    Invalid,
}

impl StreamRole {
    /// Stream id reported to the framework. [`StreamRole::Invalid`] has no
    /// id and reports `u32::MAX`.
    pub fn id(&self) -> u32 {
        match self {
            StreamRole::Preview => 0,
            StreamRole::Record => 1,
            StreamRole::Capture => 2,
            StreamRole::Callback => 3,
            StreamRole::Zsl => 4,
            StreamRole::Invalid => u32::MAX,
        }
    }

    pub fn from_id(id: u32) -> Option<StreamRole> {
        match id {
            0 => Some(StreamRole::Preview),
            1 => Some(StreamRole::Record),
            2 => Some(StreamRole::Capture),
            3 => Some(StreamRole::Callback),
            4 => Some(StreamRole::Zsl),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamRole::Preview => "preview",
            StreamRole::Record => "record",
            StreamRole::Capture => "capture",
            StreamRole::Callback => "callback",
            StreamRole::Zsl => "zsl",
            StreamRole::Invalid => "invalid",
        }
    }

    /// Roles which own a capture engine of their own.
    pub fn engine_roles() -> [StreamRole; 4] {
        [
            StreamRole::Preview,
            StreamRole::Record,
            StreamRole::Capture,
            StreamRole::Callback,
        ]
    }

    /// Resolve a requested pixel format to a role.
    ///
    /// The opaque hardware preview format resolves to [`StreamRole::Preview`]
    /// while no preview stream is live and falls back to
    /// [`StreamRole::Record`] once one is. Formats with no entry in the table
    /// resolve to [`StreamRole::Invalid`].
    ///
    /// # Example
    ///
    /// ```
    /// use camstream::format::PixelFormat;
    /// use camstream::role::StreamRole;
    ///
    /// let fmt = PixelFormat::ImplementationDefined;
    /// assert_eq!(StreamRole::resolve(fmt, false), StreamRole::Preview);
    /// assert_eq!(StreamRole::resolve(fmt, true), StreamRole::Record);
    /// ```
    pub fn resolve(format: PixelFormat, preview_live: bool) -> StreamRole {
        match format {
            PixelFormat::ImplementationDefined if preview_live => StreamRole::Record,
            PixelFormat::ImplementationDefined => StreamRole::Preview,
            PixelFormat::Yv12 | PixelFormat::YCrCb420Sp | PixelFormat::YCbCr420Flexible => {
                StreamRole::Callback
            }
            PixelFormat::Blob => StreamRole::Capture,
            PixelFormat::Zsl => StreamRole::Zsl,
            PixelFormat::Rgba8888 | PixelFormat::Other(_) => StreamRole::Invalid,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
