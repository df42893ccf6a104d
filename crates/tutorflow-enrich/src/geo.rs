//! Postal-code geography: sector centroids, regions, MRT proximity
//!
//! Singapore postal codes encode a two-digit sector in their prefix. The
//! static tables below map sectors to planning regions and approximate
//! centroids, and hold one entry per MRT station used for proximity. The
//! tables are embedded; resolution never does IO.

use regex::Regex;
use std::sync::LazyLock;
use tutorflow_model::Region;

/// Result of resolving one postal code.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoResolution {
    pub lat: f64,
    pub lon: f64,
    pub region: Region,
    pub nearest_mrt: String,
    pub nearest_mrt_line: String,
    pub nearest_mrt_distance_m: i32,
}

static POSTAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6}$").unwrap());

/// Strict six-digit postal check, shared with validation.
#[must_use]
pub fn is_valid_postal(code: &str) -> bool {
    POSTAL_RE.is_match(code)
}

/// Planning region for a postal sector (first two digits).
fn region_for_sector(sector: u8) -> Option<Region> {
    match sector {
        1..=41 | 58 | 59 => Some(Region::Central),
        42..=52 | 81 => Some(Region::East),
        53..=57 | 79 | 80 => Some(Region::NorthEast),
        60..=71 => Some(Region::West),
        72..=78 => Some(Region::North),
        _ => None,
    }
}

/// Approximate sector centroid. Coverage is the populated sectors; the
/// handful of unassigned prefixes return `None` and the assignment keeps
/// textual location only.
fn sector_centroid(sector: u8) -> Option<(f64, f64)> {
    let point = match sector {
        1..=8 => (1.2840, 103.8510),   // CBD / Raffles Place
        9 | 10 => (1.3010, 103.8180),  // Orchard / Tanglin
        11..=13 => (1.3180, 103.8420), // Novena / Toa Payoh fringe
        14..=16 => (1.3010, 103.8860), // Geylang / Kallang
        17..=19 => (1.3000, 103.8560), // Bugis / Rochor
        20 | 21 => (1.3270, 103.8430), // Balestier
        22 | 23 => (1.2830, 103.8200), // Bukit Merah
        24..=27 => (1.3180, 103.8070), // Holland / Bukit Timah
        28..=30 => (1.3260, 103.8090), // Sixth Avenue
        31..=33 => (1.3330, 103.8470), // Toa Payoh
        34..=37 => (1.3200, 103.8850), // Macpherson / Aljunied
        38..=41 => (1.3130, 103.9000), // Paya Lebar / Eunos
        42..=45 => (1.3060, 103.9060), // Katong / Marine Parade
        46..=48 => (1.3240, 103.9270), // Bedok
        49 | 50 | 81 => (1.3620, 103.9670), // Changi / Loyang
        51 => (1.3730, 103.9490),      // Pasir Ris
        52 => (1.3530, 103.9440),      // Tampines
        53 | 54 => (1.3920, 103.8990), // Hougang / Sengkang / Punggol
        55 => (1.3570, 103.8710),      // Serangoon
        56 | 57 => (1.3680, 103.8490), // Ang Mo Kio / Bishan north
        58 | 59 => (1.3500, 103.7780), // Upper Bukit Timah
        60..=64 => (1.3330, 103.7270), // Jurong
        65..=67 => (1.3520, 103.7520), // Bukit Batok / Hillview
        68 | 69 => (1.3850, 103.7450), // Choa Chu Kang
        70 | 71 => (1.4130, 103.7620), // Kranji / Lim Chu Kang
        72 | 73 => (1.4370, 103.7860), // Woodlands
        75 | 76 => (1.4300, 103.8350), // Yishun / Sembawang
        77 | 78 => (1.4050, 103.8180), // Upper Thomson north
        79 | 80 => (1.3960, 103.8730), // Seletar
        _ => return None,
    };
    Some(point)
}

/// One MRT station used for proximity lookups.
struct Station {
    name: &'static str,
    line: &'static str,
    lat: f64,
    lon: f64,
}

static STATIONS: &[Station] = &[
    Station { name: "Pasir Ris", line: "EW", lat: 1.3732, lon: 103.9493 },
    Station { name: "Tampines", line: "EW", lat: 1.3536, lon: 103.9452 },
    Station { name: "Simei", line: "EW", lat: 1.3432, lon: 103.9532 },
    Station { name: "Bedok", line: "EW", lat: 1.3240, lon: 103.9300 },
    Station { name: "Eunos", line: "EW", lat: 1.3198, lon: 103.9032 },
    Station { name: "Aljunied", line: "EW", lat: 1.3164, lon: 103.8829 },
    Station { name: "Kallang", line: "EW", lat: 1.3115, lon: 103.8714 },
    Station { name: "Bugis", line: "EW", lat: 1.3009, lon: 103.8559 },
    Station { name: "Raffles Place", line: "EW", lat: 1.2840, lon: 103.8515 },
    Station { name: "Outram Park", line: "EW", lat: 1.2803, lon: 103.8394 },
    Station { name: "Buona Vista", line: "EW", lat: 1.3074, lon: 103.7903 },
    Station { name: "Clementi", line: "EW", lat: 1.3151, lon: 103.7652 },
    Station { name: "Jurong East", line: "EW", lat: 1.3330, lon: 103.7422 },
    Station { name: "Boon Lay", line: "EW", lat: 1.3386, lon: 103.7060 },
    Station { name: "Marina Bay", line: "NS", lat: 1.2763, lon: 103.8545 },
    Station { name: "Orchard", line: "NS", lat: 1.3040, lon: 103.8318 },
    Station { name: "Novena", line: "NS", lat: 1.3204, lon: 103.8438 },
    Station { name: "Toa Payoh", line: "NS", lat: 1.3327, lon: 103.8474 },
    Station { name: "Bishan", line: "NS", lat: 1.3513, lon: 103.8492 },
    Station { name: "Ang Mo Kio", line: "NS", lat: 1.3700, lon: 103.8495 },
    Station { name: "Yishun", line: "NS", lat: 1.4294, lon: 103.8350 },
    Station { name: "Sembawang", line: "NS", lat: 1.4491, lon: 103.8201 },
    Station { name: "Admiralty", line: "NS", lat: 1.4406, lon: 103.8010 },
    Station { name: "Woodlands", line: "NS", lat: 1.4370, lon: 103.7863 },
    Station { name: "Kranji", line: "NS", lat: 1.4251, lon: 103.7620 },
    Station { name: "Choa Chu Kang", line: "NS", lat: 1.3854, lon: 103.7443 },
    Station { name: "Bukit Batok", line: "NS", lat: 1.3490, lon: 103.7496 },
    Station { name: "Serangoon", line: "NE", lat: 1.3497, lon: 103.8732 },
    Station { name: "Hougang", line: "NE", lat: 1.3713, lon: 103.8924 },
    Station { name: "Sengkang", line: "NE", lat: 1.3917, lon: 103.8954 },
    Station { name: "Punggol", line: "NE", lat: 1.4052, lon: 103.9023 },
    Station { name: "HarbourFront", line: "NE", lat: 1.2653, lon: 103.8220 },
    Station { name: "Holland Village", line: "CC", lat: 1.3112, lon: 103.7961 },
    Station { name: "Paya Lebar", line: "CC", lat: 1.3177, lon: 103.8924 },
    Station { name: "Bukit Panjang", line: "DT", lat: 1.3784, lon: 103.7626 },
    Station { name: "Hillview", line: "DT", lat: 1.3624, lon: 103.7676 },
    Station { name: "Upper Changi", line: "DT", lat: 1.3417, lon: 103.9614 },
    Station { name: "Marine Parade", line: "TE", lat: 1.3028, lon: 103.9050 },
    Station { name: "Upper Thomson", line: "TE", lat: 1.3543, lon: 103.8331 },
    Station { name: "Lentor", line: "TE", lat: 1.3847, lon: 103.8363 },
];

/// Great-circle distance in kilometres.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Nearest station to a point.
fn nearest_station(lat: f64, lon: f64) -> (&'static Station, f64) {
    let mut best = &STATIONS[0];
    let mut best_km = f64::INFINITY;
    for station in STATIONS {
        let km = haversine_km(lat, lon, station.lat, station.lon);
        if km < best_km {
            best = station;
            best_km = km;
        }
    }
    (best, best_km)
}

/// Resolve a six-digit postal code to coordinates, region, and the nearest
/// MRT station. Returns `None` for malformed codes and unassigned sectors.
#[must_use]
pub fn resolve_postal(code: &str) -> Option<GeoResolution> {
    if !is_valid_postal(code) {
        return None;
    }
    let sector: u8 = code[..2].parse().ok()?;
    let region = region_for_sector(sector)?;
    let (lat, lon) = sector_centroid(sector)?;
    let (station, km) = nearest_station(lat, lon);
    Some(GeoResolution {
        lat,
        lon,
        region,
        nearest_mrt: station.name.to_string(),
        nearest_mrt_line: station.line.to_string(),
        nearest_mrt_distance_m: (km * 1000.0).round() as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postal_shape_check() {
        assert!(is_valid_postal("520123"));
        assert!(!is_valid_postal("52012"));
        assert!(!is_valid_postal("5201234"));
        assert!(!is_valid_postal("52O123"));
    }

    #[test]
    fn test_tampines_resolves_east() {
        let geo = resolve_postal("520123").unwrap();
        assert_eq!(geo.region, Region::East);
        assert_eq!(geo.nearest_mrt, "Tampines");
        assert_eq!(geo.nearest_mrt_line, "EW");
        assert!(geo.nearest_mrt_distance_m < 2_000);
    }

    #[test]
    fn test_woodlands_resolves_north() {
        let geo = resolve_postal("730123").unwrap();
        assert_eq!(geo.region, Region::North);
        assert_eq!(geo.nearest_mrt, "Woodlands");
    }

    #[test]
    fn test_serangoon_resolves_north_east() {
        let geo = resolve_postal("550123").unwrap();
        assert_eq!(geo.region, Region::NorthEast);
    }

    #[test]
    fn test_unassigned_sector_is_none() {
        assert!(resolve_postal("990000").is_none());
        assert!(resolve_postal("740000").is_none());
    }

    #[test]
    fn test_haversine_known_distance() {
        // Tampines to Jurong East is roughly 23km across the island
        let km = haversine_km(1.3536, 103.9452, 1.3330, 103.7422);
        assert!((20.0..26.0).contains(&km), "got {km}");
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        assert!(haversine_km(1.35, 103.9, 1.35, 103.9) < 1e-9);
    }
}
