//! Chart oracle capability and the built-in mean-motion implementation.
//!
//! The mean-motion oracle is a lightweight deterministic model: circular coplanar orbits for
//! the planets, the mean lunar longitude, sidereal time for the angles, and whole-sign houses.
//! It needs no ephemeris files and no network, and is good to within a few degrees for the
//! inner bodies. Swap in a precise engine by implementing [`ChartOracle`].

use super::{normalize_degrees, BirthFact, Body, Chart, ChartPoint, PointId, Sign};
use crate::error::OracleError;
use chrono::{NaiveDate, NaiveDateTime};

/// Computes a natal chart from a birth fact. Implementations must be deterministic.
pub trait ChartOracle: Send + Sync {
    fn cast(&self, fact: &BirthFact) -> Result<Chart, OracleError>;
}

/// Latitude beyond which the ecliptic can run parallel to the horizon and the Ascendant
/// is undefined.
const POLAR_LATITUDE: f64 = 66.56;
const OBLIQUITY_J2000: f64 = 23.4393;
const MIN_YEAR: i32 = 1000;
const MAX_YEAR: i32 = 3000;

/// (mean longitude at J2000, daily motion, semi-major axis in AU)
const ORBITS: [(Body, f64, f64, f64); 8] = [
    (Body::Mercury, 252.2509, 4.092_334_4, 0.3871),
    (Body::Venus, 181.9798, 1.602_130_2, 0.7233),
    (Body::Mars, 355.4330, 0.524_020_8, 1.5237),
    (Body::Jupiter, 34.3515, 0.083_085_3, 5.2026),
    (Body::Saturn, 50.0774, 0.033_444_3, 9.5549),
    (Body::Uranus, 314.0550, 0.011_732_1, 19.2184),
    (Body::Neptune, 304.3487, 0.005_981_0, 30.1104),
    (Body::Pluto, 238.9290, 0.003_969_0, 39.4821),
];
const EARTH_L0: f64 = 100.4645;
const EARTH_MOTION: f64 = 0.985_609_1;
const MOON_L0: f64 = 218.316;
const MOON_MOTION: f64 = 13.176_396;

/// (name, exact angle, orb)
const ASPECTS: [(&str, f64, f64); 5] = [
    ("Conjunction", 0.0, 8.0),
    ("Sextile", 60.0, 6.0),
    ("Square", 90.0, 8.0),
    ("Trine", 120.0, 8.0),
    ("Opposition", 180.0, 8.0),
];

/// Deterministic low-precision chart engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanMotionOracle;

impl MeanMotionOracle {
    pub fn new() -> Self {
        Self
    }

    fn validate(fact: &BirthFact) -> Result<(), OracleError> {
        let coords_ok = fact.latitude.is_finite()
            && fact.longitude.is_finite()
            && (-90.0..=90.0).contains(&fact.latitude)
            && (-180.0..=180.0).contains(&fact.longitude);
        if !coords_ok {
            return Err(OracleError::InvalidCoordinates {
                latitude: fact.latitude,
                longitude: fact.longitude,
            });
        }
        let year = chrono::Datelike::year(&fact.birth_date);
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(OracleError::YearOutOfRange(year));
        }
        Ok(())
    }

    /// Days since J2000.0 (2000-01-01 12:00 UT), with local mean time shifted to UT.
    fn days_since_j2000(fact: &BirthFact) -> Result<f64, OracleError> {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .ok_or_else(|| OracleError::Computation("epoch construction".into()))?;
        let local = NaiveDateTime::new(fact.birth_date, fact.effective_time());
        let seconds = (local - epoch).num_seconds() as f64 - fact.longitude / 15.0 * 3600.0;
        Ok(seconds / 86_400.0)
    }

    fn body_longitudes(d: f64) -> [(Body, f64); 10] {
        let earth = (EARTH_L0 + EARTH_MOTION * d).to_radians();
        let (ex, ey) = (earth.cos(), earth.sin());

        let mut out = [(Body::Sun, 0.0); 10];
        out[0] = (Body::Sun, normalize_degrees(earth.to_degrees() + 180.0));
        out[1] = (Body::Moon, normalize_degrees(MOON_L0 + MOON_MOTION * d));
        for (i, (body, l0, motion, a)) in ORBITS.iter().enumerate() {
            let l = (l0 + motion * d).to_radians();
            let x = a * l.cos() - ex;
            let y = a * l.sin() - ey;
            out[i + 2] = (*body, normalize_degrees(y.atan2(x).to_degrees()));
        }
        out
    }

    /// (Ascendant, Midheaven) longitudes.
    fn angles(d: f64, latitude: f64, longitude: f64) -> (f64, f64) {
        let gmst = 280.460_618_37 + 360.985_647_366_29 * d;
        let ramc = normalize_degrees(gmst + longitude).to_radians();
        let eps = OBLIQUITY_J2000.to_radians();
        let phi = latitude.to_radians();

        let mc = ramc.sin().atan2(ramc.cos() * eps.cos());
        let asc = ramc
            .cos()
            .atan2(-(ramc.sin() * eps.cos() + phi.tan() * eps.sin()));
        (
            normalize_degrees(asc.to_degrees()),
            normalize_degrees(mc.to_degrees()),
        )
    }

    fn aspects_for(index: usize, longitudes: &[(Body, f64); 10]) -> Vec<String> {
        let (_, own) = longitudes[index];
        let mut out = Vec::new();
        for (j, (other, lon)) in longitudes.iter().enumerate() {
            if j == index {
                continue;
            }
            let raw = (own - lon).abs() % 360.0;
            let separation = raw.min(360.0 - raw);
            if let Some((name, _, _)) = ASPECTS
                .iter()
                .find(|(_, angle, orb)| (separation - angle).abs() <= *orb)
            {
                out.push(format!("{} {}", name, other));
            }
        }
        out
    }
}

fn whole_sign_house(sign: Sign, ascendant: Sign) -> u8 {
    ((sign.index() + 12 - ascendant.index()) % 12) as u8 + 1
}

impl ChartOracle for MeanMotionOracle {
    fn cast(&self, fact: &BirthFact) -> Result<Chart, OracleError> {
        Self::validate(fact)?;
        let d = Self::days_since_j2000(fact)?;
        let longitudes = Self::body_longitudes(d);

        let angles = (fact.latitude.abs() < POLAR_LATITUDE)
            .then(|| Self::angles(d, fact.latitude, fact.longitude));
        let asc_sign = angles.map(|(asc, _)| Sign::from_longitude(asc));

        let mut points: Vec<ChartPoint> = longitudes
            .iter()
            .enumerate()
            .map(|(i, (body, lon))| {
                let sign = Sign::from_longitude(*lon);
                ChartPoint {
                    point_id: PointId::Body(*body),
                    sign: Some(sign),
                    house: asc_sign.map(|asc| whole_sign_house(sign, asc)),
                    longitude: *lon,
                    aspects: Self::aspects_for(i, &longitudes),
                }
            })
            .collect();

        if let (Some((asc, mc)), Some(asc_sign)) = (angles, asc_sign) {
            let mc_sign = Sign::from_longitude(mc);
            points.push(ChartPoint {
                point_id: PointId::Ascendant,
                sign: Some(asc_sign),
                house: Some(1),
                longitude: asc,
                aspects: Vec::new(),
            });
            points.push(ChartPoint {
                point_id: PointId::Midheaven,
                sign: Some(mc_sign),
                house: Some(whole_sign_house(mc_sign, asc_sign)),
                longitude: mc,
                aspects: Vec::new(),
            });
        } else {
            tracing::debug!(
                target: "natal::oracle",
                latitude = fact.latitude,
                "polar latitude: angles and houses left unresolved"
            );
        }

        Ok(Chart::new(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn fact(y: i32, m: u32, d: u32, h: u32, lat: f64, lon: f64) -> BirthFact {
        BirthFact::new("test", NaiveDate::from_ymd_opt(y, m, d).unwrap(), lat, lon)
            .with_time(NaiveTime::from_hms_opt(h, 0, 0).unwrap())
    }

    #[test]
    fn sun_near_capricorn_at_new_year_2000() {
        let chart = MeanMotionOracle.cast(&fact(2000, 1, 1, 12, 51.48, 0.0)).unwrap();
        let sun = chart.body(Body::Sun).unwrap();
        assert_eq!(sun.sign, Some(Sign::Capricorn));
        assert!((sun.longitude - 280.4).abs() < 1.5, "sun at {}", sun.longitude);
    }

    #[test]
    fn all_points_resolved_at_temperate_latitude() {
        let chart = MeanMotionOracle
            .cast(&fact(2000, 1, 1, 10, 32.717, -117.15))
            .unwrap();
        for body in Body::ALL {
            let p = chart.body(body).unwrap();
            assert!(p.sign.is_some());
            assert!((1..=12).contains(&p.house.unwrap()));
            assert!((0.0..360.0).contains(&p.longitude));
        }
        assert_eq!(chart.resolve(PointId::Ascendant).unwrap().house, Some(1));
        assert!(chart.resolve(PointId::Midheaven).is_some());
    }

    #[test]
    fn midheaven_sits_in_ninth_or_tenth_region() {
        // Whole-sign MC falls between houses 8 and 11 away from polar latitudes.
        let chart = MeanMotionOracle.cast(&fact(1985, 7, 4, 18, 40.0, -74.0)).unwrap();
        let house = chart.resolve(PointId::Midheaven).unwrap().house.unwrap();
        assert!((8..=11).contains(&house), "mc house {}", house);
    }

    #[test]
    fn polar_birth_has_no_angles() {
        let chart = MeanMotionOracle.cast(&fact(1970, 6, 1, 12, 78.2, 15.6)).unwrap();
        assert!(chart.resolve(PointId::Ascendant).is_none());
        assert!(chart.body(Body::Sun).unwrap().house.is_none());
        assert!(chart.body(Body::Sun).unwrap().sign.is_some());
    }

    #[test]
    fn rejects_invalid_input() {
        assert!(matches!(
            MeanMotionOracle.cast(&fact(2000, 1, 1, 12, 95.0, 0.0)),
            Err(OracleError::InvalidCoordinates { .. })
        ));
        assert_eq!(
            MeanMotionOracle.cast(&fact(500, 1, 1, 12, 10.0, 0.0)),
            Err(OracleError::YearOutOfRange(500))
        );
    }

    #[test]
    fn aspects_are_symmetric() {
        let chart = MeanMotionOracle.cast(&fact(1969, 7, 20, 20, 28.5, -80.6)).unwrap();
        for body in Body::ALL {
            for aspect in &chart.body(body).unwrap().aspects {
                let (kind, other) = aspect.split_once(' ').unwrap();
                let other = Body::ALL.iter().find(|b| b.as_str() == other).unwrap();
                let expected = format!("{} {}", kind, body);
                assert!(chart.body(*other).unwrap().aspects.contains(&expected));
            }
        }
    }
}
