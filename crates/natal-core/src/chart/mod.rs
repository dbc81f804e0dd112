//! Natal chart vocabulary: signs, elements, modalities, bodies and the resolved chart.
//!
//! Every classification here is a total function over a closed enum, so a known sign always
//! has an element, a modality and a ruler in both rulership schemes.

mod oracle;

pub use oracle::{ChartOracle, MeanMotionOracle};

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

// -----------------------------------------------------------------------------
// Signs, elements, modalities
// -----------------------------------------------------------------------------

/// Zodiac signs in ecliptic order starting at 0° Aries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

impl Sign {
    pub const ALL: [Sign; 12] = [
        Sign::Aries,
        Sign::Taurus,
        Sign::Gemini,
        Sign::Cancer,
        Sign::Leo,
        Sign::Virgo,
        Sign::Libra,
        Sign::Scorpio,
        Sign::Sagittarius,
        Sign::Capricorn,
        Sign::Aquarius,
        Sign::Pisces,
    ];

    /// Sign occupied by an ecliptic longitude (any real value, wrapped into [0, 360)).
    pub fn from_longitude(longitude: f64) -> Sign {
        let lon = normalize_degrees(longitude);
        let idx = ((lon / 30.0).floor() as usize).min(11);
        Sign::ALL[idx]
    }

    /// Zero-based position in the zodiac (Aries = 0).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn element(self) -> Element {
        match self {
            Sign::Aries | Sign::Leo | Sign::Sagittarius => Element::Fire,
            Sign::Taurus | Sign::Virgo | Sign::Capricorn => Element::Earth,
            Sign::Gemini | Sign::Libra | Sign::Aquarius => Element::Air,
            Sign::Cancer | Sign::Scorpio | Sign::Pisces => Element::Water,
        }
    }

    pub fn modality(self) -> Modality {
        match self {
            Sign::Aries | Sign::Cancer | Sign::Libra | Sign::Capricorn => Modality::Cardinal,
            Sign::Taurus | Sign::Leo | Sign::Scorpio | Sign::Aquarius => Modality::Fixed,
            Sign::Gemini | Sign::Virgo | Sign::Sagittarius | Sign::Pisces => Modality::Mutable,
        }
    }

    /// Ruler under a given rulership scheme.
    pub fn ruler(self, scheme: Rulership) -> Body {
        match (self, scheme) {
            (Sign::Scorpio, Rulership::Modern) => Body::Pluto,
            (Sign::Aquarius, Rulership::Modern) => Body::Uranus,
            (Sign::Pisces, Rulership::Modern) => Body::Neptune,
            (Sign::Aries | Sign::Scorpio, _) => Body::Mars,
            (Sign::Taurus | Sign::Libra, _) => Body::Venus,
            (Sign::Gemini | Sign::Virgo, _) => Body::Mercury,
            (Sign::Cancer, _) => Body::Moon,
            (Sign::Leo, _) => Body::Sun,
            (Sign::Sagittarius | Sign::Pisces, _) => Body::Jupiter,
            (Sign::Capricorn | Sign::Aquarius, _) => Body::Saturn,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Sign::Aries => "Aries",
            Sign::Taurus => "Taurus",
            Sign::Gemini => "Gemini",
            Sign::Cancer => "Cancer",
            Sign::Leo => "Leo",
            Sign::Virgo => "Virgo",
            Sign::Libra => "Libra",
            Sign::Scorpio => "Scorpio",
            Sign::Sagittarius => "Sagittarius",
            Sign::Capricorn => "Capricorn",
            Sign::Aquarius => "Aquarius",
            Sign::Pisces => "Pisces",
        }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classical elements in the fixed sequence used for counts and tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Element {
    Fire,
    Earth,
    Air,
    Water,
}

impl Element {
    pub const ALL: [Element; 4] = [Element::Fire, Element::Earth, Element::Air, Element::Water];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Element::Fire => "Fire",
            Element::Earth => "Earth",
            Element::Air => "Air",
            Element::Water => "Water",
        }
    }

    /// Lowercase key used inside feature names (`element_modern_dispositor_fire_count`).
    pub fn key(self) -> &'static str {
        match self {
            Element::Fire => "fire",
            Element::Earth => "earth",
            Element::Air => "air",
            Element::Water => "water",
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Cardinal,
    Fixed,
    Mutable,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Cardinal => "Cardinal",
            Modality::Fixed => "Fixed",
            Modality::Mutable => "Mutable",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rulership scheme: traditional (seven visible bodies) or modern (outer planets included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rulership {
    Traditional,
    Modern,
}

impl Rulership {
    pub const ALL: [Rulership; 2] = [Rulership::Traditional, Rulership::Modern];

    pub fn key(self) -> &'static str {
        match self {
            Rulership::Traditional => "traditional",
            Rulership::Modern => "modern",
        }
    }
}

// -----------------------------------------------------------------------------
// Bodies and chart points
// -----------------------------------------------------------------------------

/// The ten bodies, in the fixed iteration order Sun → Pluto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Body {
    Sun,
    Moon,
    Mercury,
    Venus,
    Mars,
    Jupiter,
    Saturn,
    Uranus,
    Neptune,
    Pluto,
}

impl Body {
    pub const ALL: [Body; 10] = [
        Body::Sun,
        Body::Moon,
        Body::Mercury,
        Body::Venus,
        Body::Mars,
        Body::Jupiter,
        Body::Saturn,
        Body::Uranus,
        Body::Neptune,
        Body::Pluto,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase key used as feature-name prefix.
    pub fn key(self) -> &'static str {
        match self {
            Body::Sun => "sun",
            Body::Moon => "moon",
            Body::Mercury => "mercury",
            Body::Venus => "venus",
            Body::Mars => "mars",
            Body::Jupiter => "jupiter",
            Body::Saturn => "saturn",
            Body::Uranus => "uranus",
            Body::Neptune => "neptune",
            Body::Pluto => "pluto",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Body::Sun => "Sun",
            Body::Moon => "Moon",
            Body::Mercury => "Mercury",
            Body::Venus => "Venus",
            Body::Mars => "Mars",
            Body::Jupiter => "Jupiter",
            Body::Saturn => "Saturn",
            Body::Uranus => "Uranus",
            Body::Neptune => "Neptune",
            Body::Pluto => "Pluto",
        }
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any point an oracle can place: a body or one of the two chart angles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointId {
    Body(Body),
    Ascendant,
    Midheaven,
}

impl PointId {
    /// Feature-name prefix (`sun`, `ascendant`, `mc`).
    pub fn key(self) -> &'static str {
        match self {
            PointId::Body(body) => body.key(),
            PointId::Ascendant => "ascendant",
            PointId::Midheaven => "mc",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PointId::Body(body) => body.as_str(),
            PointId::Ascendant => "Ascendant",
            PointId::Midheaven => "MC",
        }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wraps an angle into [0, 360).
pub fn normalize_degrees(value: f64) -> f64 {
    let wrapped = value.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

// -----------------------------------------------------------------------------
// Birth facts and resolved charts
// -----------------------------------------------------------------------------

/// Immutable birth data for one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthFact {
    pub name: String,
    pub birth_date: NaiveDate,
    /// Local mean time at the birthplace; noon when unknown.
    #[serde(default)]
    pub birth_time: Option<NaiveTime>,
    pub latitude: f64,
    pub longitude: f64,
}

impl BirthFact {
    pub fn new(name: impl Into<String>, birth_date: NaiveDate, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            birth_date,
            birth_time: None,
            latitude,
            longitude,
        }
    }

    pub fn with_time(mut self, time: NaiveTime) -> Self {
        self.birth_time = Some(time);
        self
    }

    /// Birth time, defaulting to 12:00 when it was not recorded.
    pub fn effective_time(&self) -> NaiveTime {
        self.birth_time
            .unwrap_or_else(|| NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN))
    }
}

/// One placed point of a chart. Fields the oracle could not resolve are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub point_id: PointId,
    pub sign: Option<Sign>,
    pub house: Option<u8>,
    /// Ecliptic longitude in [0, 360).
    pub longitude: f64,
    #[serde(default)]
    pub aspects: Vec<String>,
}

impl ChartPoint {
    pub fn element(&self) -> Option<Element> {
        self.sign.map(Sign::element)
    }

    pub fn modality(&self) -> Option<Modality> {
        self.sign.map(Sign::modality)
    }

    /// Degree within the zodiac rounded to 0.1.
    pub fn degree(&self) -> f64 {
        (normalize_degrees(self.longitude) * 10.0).round() / 10.0 % 360.0
    }
}

/// The output of a [`ChartOracle`]: whatever points could be placed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    points: Vec<ChartPoint>,
}

impl Chart {
    pub fn new(points: Vec<ChartPoint>) -> Self {
        Self { points }
    }

    /// A chart with nothing resolved, used when the oracle fails.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn resolve(&self, point: PointId) -> Option<&ChartPoint> {
        self.points.iter().find(|p| p.point_id == point)
    }

    pub fn body(&self, body: Body) -> Option<&ChartPoint> {
        self.resolve(PointId::Body(body))
    }

    pub fn points(&self) -> &[ChartPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
