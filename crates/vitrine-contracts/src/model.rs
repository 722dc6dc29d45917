use std::fmt;

use serde::{Deserialize, Serialize};

pub const MAX_ITEMS: usize = 3;
pub const MIN_SCALE: f64 = 0.5;
pub const MAX_SCALE: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub display_name: String,
    pub encoded_data: String,
    pub media_type: String,
    #[serde(default)]
    pub dimensions: Option<(u32, u32)>,
}

impl ImageDescriptor {
    pub fn new(
        display_name: impl Into<String>,
        encoded_data: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            encoded_data: encoded_data.into(),
            media_type: media_type.into(),
            dimensions: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }
}

/// The photo of the person accessories are composited onto.
///
/// Unlike accessory images, the subject always knows its pixel size: the
/// prompt pins the output to exactly these dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPhoto {
    image: ImageDescriptor,
    width: u32,
    height: u32,
}

impl SubjectPhoto {
    pub fn new(image: ImageDescriptor, width: u32, height: u32) -> Self {
        let image = image.with_dimensions(width, height);
        Self {
            image,
            width,
            height,
        }
    }

    /// Returns `None` when the descriptor carries no dimensions.
    pub fn from_descriptor(image: ImageDescriptor) -> Option<Self> {
        let (width, height) = image.dimensions?;
        Some(Self::new(image, width, height))
    }

    pub fn image(&self) -> &ImageDescriptor {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finger {
    Thumb,
    Index,
    Middle,
    Ring,
    Pinky,
}

impl Finger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thumb => "thumb",
            Self::Index => "index",
            Self::Middle => "middle",
            Self::Ring => "ring",
            Self::Pinky => "pinky",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "thumb" => Some(Self::Thumb),
            "index" => Some(Self::Index),
            "middle" => Some(Self::Middle),
            "ring" => Some(Self::Ring),
            "pinky" => Some(Self::Pinky),
            _ => None,
        }
    }
}

/// Accessory category together with the placement detail that only makes
/// sense for that category. `None` placements mean "either / unspecified".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryKind {
    Necklace,
    Ring { finger: Option<Finger> },
    Bracelet { wrist: Option<Side> },
    Earring { side: Option<Side> },
    Hat,
    Scarf,
    Handbag { hand: Option<Side> },
    Other(String),
}

impl AccessoryKind {
    pub const KNOWN_CATEGORIES: &'static [&'static str] = &[
        "necklace", "ring", "bracelet", "earring", "hat", "scarf", "handbag",
    ];

    /// Exact, case-sensitive match; unrecognized tokens become `Other`.
    pub fn from_category(category: &str) -> Self {
        match category {
            "necklace" => Self::Necklace,
            "ring" => Self::Ring { finger: None },
            "bracelet" => Self::Bracelet { wrist: None },
            "earring" => Self::Earring { side: None },
            "hat" => Self::Hat,
            "scarf" => Self::Scarf,
            "handbag" => Self::Handbag { hand: None },
            other => Self::Other(other.to_string()),
        }
    }

    pub fn category(&self) -> &str {
        match self {
            Self::Necklace => "necklace",
            Self::Ring { .. } => "ring",
            Self::Bracelet { .. } => "bracelet",
            Self::Earring { .. } => "earring",
            Self::Hat => "hat",
            Self::Scarf => "scarf",
            Self::Handbag { .. } => "handbag",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for AccessoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessoryItem {
    pub id: u64,
    pub image: Option<ImageDescriptor>,
    pub kind: AccessoryKind,
    pub scale: f64,
}

impl AccessoryItem {
    pub fn new(id: u64, kind: AccessoryKind) -> Self {
        Self {
            id,
            image: None,
            kind,
            scale: 1.0,
        }
    }

    pub fn with_image(mut self, image: ImageDescriptor) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn scale_in_range(&self) -> bool {
        (MIN_SCALE..=MAX_SCALE).contains(&self.scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveExisting {
    #[default]
    Auto,
    Yes,
    No,
}

impl RemoveExisting {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Yes => "yes",
            Self::No => "no",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "yes" | "true" | "on" => Some(Self::Yes),
            "no" | "false" | "off" => Some(Self::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightingEffect {
    #[default]
    None,
    Soft,
    Studio,
    Warm,
    Cool,
    Dramatic,
}

impl LightingEffect {
    pub const ALL: &'static [LightingEffect] = &[
        Self::None,
        Self::Soft,
        Self::Studio,
        Self::Warm,
        Self::Cool,
        Self::Dramatic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Soft => "soft",
            Self::Studio => "studio",
            Self::Warm => "warm",
            Self::Cool => "cool",
            Self::Dramatic => "dramatic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|effect| effect.as_str() == normalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub remove_existing_jewelry: RemoveExisting,
    pub lighting_effect: LightingEffect,
}
