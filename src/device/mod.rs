//! Device data model: classes, pages, lines and soft buttons

pub mod buttons;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::hardware::{DeviceHandle, Guid};

pub use buttons::{detect_edges, ButtonEdge, SoftButton};
pub use session::DeviceSession;

/// Kind of device, derived once from the hardware type GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Unknown,
    X52Pro,
    Fip,
}

impl DeviceClass {
    pub fn from_guid(guid: Guid) -> Self {
        match guid {
            Guid::X52_PRO => Self::X52Pro,
            Guid::FIP => Self::Fip,
            _ => Self::Unknown,
        }
    }

    /// Type GUID for known classes.
    pub fn guid(&self) -> Option<Guid> {
        match self {
            Self::X52Pro => Some(Guid::X52_PRO),
            Self::Fip => Some(Guid::FIP),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::X52Pro => write!(f, "X52 Pro"),
            Self::Fip => write!(f, "Flight Instrument Panel"),
        }
    }
}

/// Parses the short names used in URLs and configuration (`x52pro`, `fip`).
impl FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "x52pro" => Ok(Self::X52Pro),
            "fip" => Ok(Self::Fip),
            _ => Err(Error::InvalidArgument(format!("unknown device class: {}", s))),
        }
    }
}

/// One of the three text lines of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Top = 0,
    Middle = 1,
    Bottom = 2,
}

impl Line {
    pub const ALL: [Line; 3] = [Line::Top, Line::Middle, Line::Bottom];

    pub fn index(&self) -> u32 {
        *self as u32
    }
}

/// Selector as sent by clients; anything outside 0..=2 is rejected.
impl TryFrom<i64> for Line {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Top),
            1 => Ok(Self::Middle),
            2 => Ok(Self::Bottom),
            other => Err(Error::LineOutOfRange(other)),
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Top => write!(f, "Top"),
            Self::Middle => write!(f, "Middle"),
            Self::Bottom => write!(f, "Bottom"),
        }
    }
}

/// Content of one page. `name` is only sent to the hardware when the page is added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub top: String,
    #[serde(default)]
    pub middle: String,
    #[serde(default)]
    pub bottom: String,
}

impl PageData {
    pub fn line(&self, line: Line) -> &str {
        match line {
            Line::Top => &self.top,
            Line::Middle => &self.middle,
            Line::Bottom => &self.bottom,
        }
    }

    pub fn line_mut(&mut self, line: Line) -> &mut String {
        match line {
            Line::Top => &mut self.top,
            Line::Middle => &mut self.middle,
            Line::Bottom => &mut self.bottom,
        }
    }
}

/// Page content keyed by its index, as reported by [`DeviceInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub index: u32,
    #[serde(flatten)]
    pub data: PageData,
}

/// Read-only snapshot of one device session.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    pub class: DeviceClass,
    pub attached_at: DateTime<Utc>,
    /// Pages sorted by index.
    pub pages: Vec<PageInfo>,
    pub active_page: Option<u32>,
}

impl DeviceInfo {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, index: u32) -> Option<&PageData> {
        self.pages.iter().find(|p| p.index == index).map(|p| &p.data)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {} ({}): {} page(s), ",
            self.handle,
            self.class,
            self.page_count()
        )?;
        match self.active_page {
            Some(page) => writeln!(f, "active page {}", page)?,
            None => writeln!(f, "no active page")?,
        }
        for page in &self.pages {
            let marker = if self.active_page == Some(page.index) { '*' } else { ' ' };
            writeln!(
                f,
                " {}page {} {:?}: top={:?} middle={:?} bottom={:?}",
                marker, page.index, page.data.name, page.data.top, page.data.middle, page.data.bottom
            )?;
        }
        Ok(())
    }
}
