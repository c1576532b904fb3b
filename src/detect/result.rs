use std::fmt;

/// One detected object on a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Raw label reported by the backend (e.g. "car").
    pub label: String,
    /// Coarse class derived from the label.
    pub class: ObjectClass,
    /// Confidence in 0..=1.
    pub confidence: f32,
    /// Bounding box in normalized 0..1 coordinates.
    pub region: Region,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, region: Region) -> Self {
        let label = label.into();
        Self {
            class: ObjectClass::from_label(&label),
            label,
            confidence,
            region,
        }
    }

    /// True when `entry` names either the raw label or the coarse class.
    pub fn matches(&self, entry: &str) -> bool {
        entry.eq_ignore_ascii_case(&self.label) || entry.eq_ignore_ascii_case(self.class.as_str())
    }
}

/// Normalized bounding box; `x`/`y` is the top-left corner.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Region {
    pub const FULL_FRAME: Region = Region {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

impl ObjectClass {
    /// Map a detector label to a coarse class.
    pub fn from_label(label: &str) -> Self {
        // Sub-labels such as "car:taxi" classify by their base label.
        let base_label = label.split(':').next().unwrap_or(label);

        match base_label.to_lowercase().as_str() {
            "person" | "pedestrian" => ObjectClass::Person,
            "car" | "truck" | "bus" | "motorcycle" | "bicycle" | "train" | "vehicle" => {
                ObjectClass::Vehicle
            }
            "dog" | "cat" | "bird" | "horse" | "sheep" | "cow" | "bear" | "animal" => {
                ObjectClass::Animal
            }
            "package" | "box" | "suitcase" | "backpack" | "handbag" => ObjectClass::Package,
            _ => ObjectClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Animal => "animal",
            ObjectClass::Package => "package",
            ObjectClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
