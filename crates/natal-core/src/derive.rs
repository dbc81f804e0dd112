//! Symbolic attribute derivation: dispositors, temperaments and chart-wide tallies.
//!
//! Derivation never fails. A point the oracle could not place yields `None` for every
//! attribute that depends on it, and contributes nothing to the chart-wide counts.

use crate::chart::{Body, Chart, Element, Rulership};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four classical temperaments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperament {
    Choleric,
    Sanguine,
    Melancholic,
    Phlegmatic,
}

impl Temperament {
    pub const ALL: [Temperament; 4] = [
        Temperament::Choleric,
        Temperament::Sanguine,
        Temperament::Melancholic,
        Temperament::Phlegmatic,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_element(element: Element) -> Self {
        match element {
            Element::Fire => Temperament::Choleric,
            Element::Air => Temperament::Sanguine,
            Element::Earth => Temperament::Melancholic,
            Element::Water => Temperament::Phlegmatic,
        }
    }

    /// Temperament carried by a body independently of where it sits.
    pub fn of_body(body: Body) -> Self {
        match body {
            Body::Sun | Body::Mars | Body::Uranus => Temperament::Choleric,
            Body::Mercury | Body::Venus | Body::Jupiter => Temperament::Sanguine,
            Body::Saturn | Body::Pluto => Temperament::Melancholic,
            Body::Moon | Body::Neptune => Temperament::Phlegmatic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Temperament::Choleric => "Choleric",
            Temperament::Sanguine => "Sanguine",
            Temperament::Melancholic => "Melancholic",
            Temperament::Phlegmatic => "Phlegmatic",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Temperament::Choleric => "choleric",
            Temperament::Sanguine => "sanguine",
            Temperament::Melancholic => "melancholic",
            Temperament::Phlegmatic => "phlegmatic",
        }
    }

    pub fn profile(self) -> TemperamentProfile {
        let (professions, challenges): (&[&str], &str) = match self {
            Temperament::Choleric => (
                &["Visionary executive", "Entrepreneur", "Military leader"],
                "Channel impulsiveness and avoid authoritarian control.",
            ),
            Temperament::Sanguine => (
                &["Communicator", "Performing artist", "Inspiring educator"],
                "Keep focus and structure ideas into long-term projects.",
            ),
            Temperament::Melancholic => (
                &["Researcher", "Precision craftsperson", "Strategist"],
                "Avoid excessive self-criticism and paralysing perfectionism.",
            ),
            Temperament::Phlegmatic => (
                &["Caring mentor", "Holistic therapist", "Diplomat"],
                "Guard against complacency and learn to say no.",
            ),
        };
        TemperamentProfile {
            temperament: self,
            professions: professions.iter().map(|s| s.to_string()).collect(),
            challenges: challenges.to_string(),
        }
    }
}

impl fmt::Display for Temperament {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static vocational profile attached to the chart's dominant temperament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperamentProfile {
    pub temperament: Temperament,
    pub professions: Vec<String>,
    pub challenges: String,
}

impl TemperamentProfile {
    pub fn professions_joined(&self) -> String {
        self.professions.join("; ")
    }
}

// -----------------------------------------------------------------------------
// Tally with first-occurrence tie-breaking
// -----------------------------------------------------------------------------

/// Counts over a fixed set of `N` buckets, remembering when each bucket was first hit.
///
/// `dominant` returns the strictly largest bucket; among equal counts the bucket seen
/// earliest wins. Callers feed values in the fixed body order so the result does not
/// depend on how the chart listed its points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally<const N: usize> {
    counts: [u32; N],
    first_seen: [usize; N],
    seen: usize,
}

impl<const N: usize> Default for Tally<N> {
    fn default() -> Self {
        Self {
            counts: [0; N],
            first_seen: [usize::MAX; N],
            seen: 0,
        }
    }
}

impl<const N: usize> Tally<N> {
    pub fn add(&mut self, bucket: usize) {
        if bucket >= N {
            return;
        }
        if self.counts[bucket] == 0 {
            self.first_seen[bucket] = self.seen;
        }
        self.counts[bucket] += 1;
        self.seen += 1;
    }

    pub fn count(&self, bucket: usize) -> u32 {
        self.counts.get(bucket).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &[u32; N] {
        &self.counts
    }

    pub fn dominant(&self) -> Option<usize> {
        (0..N)
            .filter(|&i| self.counts[i] > 0)
            .max_by(|&a, &b| {
                self.counts[a]
                    .cmp(&self.counts[b])
                    .then(self.first_seen[b].cmp(&self.first_seen[a]))
            })
    }
}

pub type TemperamentTally = Tally<4>;
pub type ElementTally = Tally<4>;

// -----------------------------------------------------------------------------
// Derived attributes
// -----------------------------------------------------------------------------

/// Dispositor-derived attributes for one body under one rulership scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispositorView {
    pub ruler: Option<Body>,
    pub temperament: Option<Temperament>,
    /// Element of the sign the ruler occupies in this chart.
    pub element: Option<Element>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointDerivation {
    pub body: Body,
    pub temperament: Option<Temperament>,
    pub traditional: DispositorView,
    pub modern: DispositorView,
}

impl PointDerivation {
    pub fn dispositor(&self, scheme: Rulership) -> &DispositorView {
        match scheme {
            Rulership::Traditional => &self.traditional,
            Rulership::Modern => &self.modern,
        }
    }
}

/// Everything derived from one chart. Always has one entry per body.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedAttributeSet {
    points: Vec<PointDerivation>,
    pub temperament_counts: TemperamentTally,
    pub traditional_dispositor_temperaments: TemperamentTally,
    pub modern_dispositor_temperaments: TemperamentTally,
    pub traditional_dispositor_elements: ElementTally,
    pub modern_dispositor_elements: ElementTally,
    pub primary_profile: Option<TemperamentProfile>,
}

impl DerivedAttributeSet {
    pub fn point(&self, body: Body) -> &PointDerivation {
        &self.points[body.index()]
    }

    pub fn points(&self) -> &[PointDerivation] {
        &self.points
    }

    pub fn dispositor_temperaments(&self, scheme: Rulership) -> &TemperamentTally {
        match scheme {
            Rulership::Traditional => &self.traditional_dispositor_temperaments,
            Rulership::Modern => &self.modern_dispositor_temperaments,
        }
    }

    pub fn dispositor_elements(&self, scheme: Rulership) -> &ElementTally {
        match scheme {
            Rulership::Traditional => &self.traditional_dispositor_elements,
            Rulership::Modern => &self.modern_dispositor_elements,
        }
    }

    pub fn dominant_element(&self, scheme: Rulership) -> Option<Element> {
        self.dispositor_elements(scheme)
            .dominant()
            .map(|i| Element::ALL[i])
    }

    pub fn dominant_temperament(&self) -> Option<Temperament> {
        self.temperament_counts
            .dominant()
            .map(|i| Temperament::ALL[i])
    }
}

/// Derives dispositors, temperaments and chart-wide aggregates.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeDeriver;

impl AttributeDeriver {
    pub fn derive(chart: &Chart) -> DerivedAttributeSet {
        let sign_of = |body: Body| chart.body(body).and_then(|p| p.sign);

        let view = |body: Body, scheme: Rulership| {
            let ruler = sign_of(body).map(|s| s.ruler(scheme));
            DispositorView {
                ruler,
                temperament: ruler.map(Temperament::of_body),
                element: ruler.and_then(|r| sign_of(r)).map(|s| s.element()),
            }
        };

        let points: Vec<PointDerivation> = Body::ALL
            .iter()
            .map(|&body| PointDerivation {
                body,
                temperament: sign_of(body).map(|s| Temperament::from_element(s.element())),
                traditional: view(body, Rulership::Traditional),
                modern: view(body, Rulership::Modern),
            })
            .collect();

        let mut temperament_counts = TemperamentTally::default();
        let mut trad_temps = TemperamentTally::default();
        let mut modern_temps = TemperamentTally::default();
        let mut trad_elements = ElementTally::default();
        let mut modern_elements = ElementTally::default();

        for p in &points {
            if let Some(t) = p.temperament {
                temperament_counts.add(t.index());
            }
            if let Some(t) = p.traditional.temperament {
                trad_temps.add(t.index());
            }
            if let Some(t) = p.modern.temperament {
                modern_temps.add(t.index());
            }
            if let Some(e) = p.traditional.element {
                trad_elements.add(e.index());
            }
            if let Some(e) = p.modern.element {
                modern_elements.add(e.index());
            }
        }

        let primary_profile = temperament_counts
            .dominant()
            .map(|i| Temperament::ALL[i].profile());

        DerivedAttributeSet {
            points,
            temperament_counts,
            traditional_dispositor_temperaments: trad_temps,
            modern_dispositor_temperaments: modern_temps,
            traditional_dispositor_elements: trad_elements,
            modern_dispositor_elements: modern_elements,
            primary_profile,
        }
    }
}
