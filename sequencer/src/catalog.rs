//! Target recognition
//!
//! A small built-in catalog of named bright stars and the Messier objects.
//! Given a plate solution's center and field radius it reports which of
//! them the camera is looking at, nearest first.
//!
//! Stars are only reported inside the frame. Deep-sky objects are large
//! and often centered just off the edge, so they are also reported within
//! [`DSO_VICINITY_DEG`] of the field.

use crate::device_ops::SkyPosition;
use serde::{Deserialize, Serialize};

/// Extra search radius for deep-sky objects around the field
pub const DSO_VICINITY_DEG: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogKind {
    Star,
    DeepSky,
}

/// One built-in catalog entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogEntry {
    pub name: &'static str,
    /// Common name, e.g. "Orion Nebula" for M42
    pub alias: Option<&'static str>,
    pub kind: CatalogKind,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub magnitude: Option<f64>,
}

impl CatalogEntry {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }
}

/// A catalog entry found near a solved field.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogObject {
    pub name: String,
    pub alias: Option<String>,
    pub kind: CatalogKind,
    pub position: SkyPosition,
    pub magnitude: Option<f64>,
    /// Distance from the field center
    pub separation_deg: f64,
    /// Center lies within the frame
    pub in_frame: bool,
}

impl CatalogObject {
    fn from_entry(entry: &CatalogEntry, separation_deg: f64, radius_deg: f64) -> Self {
        Self {
            name: entry.name.to_string(),
            alias: entry.alias.map(str::to_string),
            kind: entry.kind,
            position: entry.position(),
            magnitude: entry.magnitude,
            separation_deg,
            in_frame: separation_deg <= radius_deg,
        }
    }
}

/// Half the frame diagonal in degrees.
pub fn field_radius_deg(pixel_scale_arcsec: f64, width: u32, height: u32) -> f64 {
    let (w, h) = (width as f64, height as f64);
    (w * w + h * h).sqrt() / 2.0 * pixel_scale_arcsec / 3600.0
}

/// Every entry near `center`, nearest first.
pub fn objects_in_field(center: SkyPosition, radius_deg: f64) -> Vec<CatalogObject> {
    if !(radius_deg.is_finite() && radius_deg >= 0.0) {
        return Vec::new();
    }
    let mut found: Vec<CatalogObject> = CATALOG
        .iter()
        .filter_map(|entry| {
            let separation_deg = center.separation_arcsec(&entry.position()) / 3600.0;
            let reach = match entry.kind {
                CatalogKind::Star => radius_deg,
                CatalogKind::DeepSky => radius_deg + DSO_VICINITY_DEG,
            };
            (separation_deg <= reach)
                .then(|| CatalogObject::from_entry(entry, separation_deg, radius_deg))
        })
        .collect();
    found.sort_by(|a, b| a.separation_deg.total_cmp(&b.separation_deg));
    found
}

const fn star(name: &'static str, ra_deg: f64, dec_deg: f64, magnitude: f64) -> CatalogEntry {
    CatalogEntry {
        name,
        alias: None,
        kind: CatalogKind::Star,
        ra_deg,
        dec_deg,
        magnitude: Some(magnitude),
    }
}

const fn messier(
    name: &'static str,
    alias: Option<&'static str>,
    ra_deg: f64,
    dec_deg: f64,
) -> CatalogEntry {
    CatalogEntry {
        name,
        alias,
        kind: CatalogKind::DeepSky,
        ra_deg,
        dec_deg,
        magnitude: None,
    }
}

// J2000 positions
static CATALOG: &[CatalogEntry] = &[
    // =========================================================================
    // BRIGHT STARS
    // =========================================================================
    star("Sirius", 101.287, -16.716, -1.46),
    star("Canopus", 95.988, -52.696, -0.74),
    star("Rigil Kentaurus", 219.902, -60.834, -0.27),
    star("Arcturus", 213.915, 19.182, -0.05),
    star("Vega", 279.235, 38.784, 0.03),
    star("Capella", 79.172, 45.998, 0.08),
    star("Rigel", 78.634, -8.202, 0.13),
    star("Procyon", 114.825, 5.225, 0.34),
    star("Achernar", 24.429, -57.237, 0.46),
    star("Betelgeuse", 88.793, 7.407, 0.50),
    star("Hadar", 210.956, -60.373, 0.61),
    star("Altair", 297.696, 8.868, 0.77),
    star("Acrux", 186.650, -63.099, 0.77),
    star("Aldebaran", 68.980, 16.509, 0.85),
    star("Antares", 247.352, -26.432, 0.96),
    star("Spica", 201.298, -11.161, 0.97),
    star("Pollux", 116.329, 28.026, 1.14),
    star("Fomalhaut", 344.413, -29.622, 1.16),
    star("Deneb", 310.358, 45.280, 1.25),
    star("Mimosa", 191.930, -59.689, 1.25),
    star("Regulus", 152.093, 11.967, 1.35),
    star("Adhara", 104.656, -28.972, 1.50),
    star("Castor", 113.650, 31.888, 1.58),
    star("Shaula", 263.402, -37.104, 1.62),
    star("Bellatrix", 81.283, 6.350, 1.64),
    star("Elnath", 81.573, 28.608, 1.65),
    star("Alnilam", 84.053, -1.202, 1.69),
    star("Alnitak", 85.190, -1.943, 1.77),
    star("Alioth", 193.507, 55.960, 1.77),
    star("Dubhe", 165.932, 61.751, 1.79),
    star("Mirfak", 51.081, 49.861, 1.79),
    star("Alkaid", 206.885, 49.313, 1.86),
    star("Polaris", 37.955, 89.264, 1.98),
    star("Alphard", 141.897, -8.659, 1.98),
    star("Hamal", 31.793, 23.462, 2.00),
    star("Alpheratz", 2.097, 29.090, 2.06),
    star("Saiph", 86.939, -9.670, 2.07),
    star("Rasalhague", 263.734, 12.560, 2.07),
    star("Kochab", 222.676, 74.156, 2.08),
    star("Algol", 47.042, 40.956, 2.12),
    star("Denebola", 177.265, 14.572, 2.13),
    star("Mintaka", 83.002, -0.299, 2.23),
    star("Mizar", 200.981, 54.925, 2.23),
    star("Schedar", 10.127, 56.537, 2.24),
    star("Caph", 2.295, 59.150, 2.27),
    star("Hatysa", 83.858, -5.910, 2.77),
    // =========================================================================
    // MESSIER
    // =========================================================================
    messier("M1", Some("Crab Nebula"), 83.633, 22.015),
    messier("M2", None, 323.363, -0.823),
    messier("M3", None, 205.548, 28.377),
    messier("M4", None, 245.897, -26.526),
    messier("M5", None, 229.638, 2.081),
    messier("M6", Some("Butterfly Cluster"), 265.025, -32.217),
    messier("M7", Some("Ptolemy Cluster"), 268.475, -34.817),
    messier("M8", Some("Lagoon Nebula"), 270.950, -24.383),
    messier("M9", None, 259.799, -18.516),
    messier("M10", None, 254.288, -4.100),
    messier("M11", Some("Wild Duck Cluster"), 282.767, -6.267),
    messier("M12", None, 251.809, -1.949),
    messier("M13", Some("Hercules Cluster"), 250.421, 36.460),
    messier("M14", None, 264.401, -3.246),
    messier("M15", None, 322.493, 12.167),
    messier("M16", Some("Eagle Nebula"), 274.700, -13.783),
    messier("M17", Some("Omega Nebula"), 275.196, -16.172),
    messier("M18", None, 274.975, -17.133),
    messier("M19", None, 255.657, -26.268),
    messier("M20", Some("Trifid Nebula"), 270.650, -23.033),
    messier("M21", None, 271.150, -22.500),
    messier("M22", None, 279.100, -23.905),
    messier("M23", None, 269.200, -19.017),
    messier("M24", Some("Sagittarius Star Cloud"), 274.225, -18.483),
    messier("M25", None, 277.900, -19.250),
    messier("M26", None, 281.300, -9.400),
    messier("M27", Some("Dumbbell Nebula"), 299.902, 22.721),
    messier("M28", None, 276.137, -24.870),
    messier("M29", None, 305.975, 38.517),
    messier("M30", None, 325.092, -23.180),
    messier("M31", Some("Andromeda Galaxy"), 10.685, 41.269),
    messier("M32", None, 10.674, 40.865),
    messier("M33", Some("Triangulum Galaxy"), 23.462, 30.660),
    messier("M34", None, 40.500, 42.783),
    messier("M35", None, 92.225, 24.333),
    messier("M36", None, 84.025, 34.133),
    messier("M37", None, 88.100, 32.550),
    messier("M38", None, 82.175, 35.833),
    messier("M39", None, 323.050, 48.433),
    messier("M40", Some("Winnecke 4"), 185.600, 58.083),
    messier("M41", None, 101.500, -20.733),
    messier("M42", Some("Orion Nebula"), 83.822, -5.391),
    messier("M43", Some("De Mairan's Nebula"), 83.896, -5.267),
    messier("M44", Some("Beehive Cluster"), 130.025, 19.983),
    messier("M45", Some("Pleiades"), 56.750, 24.117),
    messier("M46", None, 115.450, -14.817),
    messier("M47", None, 114.150, -14.500),
    messier("M48", None, 123.450, -5.800),
    messier("M49", None, 187.445, 8.000),
    messier("M50", None, 105.800, -8.333),
    messier("M51", Some("Whirlpool Galaxy"), 202.470, 47.195),
    messier("M52", None, 351.050, 61.583),
    messier("M53", None, 198.230, 18.168),
    messier("M54", None, 283.764, -30.480),
    messier("M55", None, 294.999, -30.965),
    messier("M56", None, 289.148, 30.184),
    messier("M57", Some("Ring Nebula"), 283.396, 33.029),
    messier("M58", None, 189.431, 11.818),
    messier("M59", None, 190.509, 11.647),
    messier("M60", None, 190.917, 11.553),
    messier("M61", None, 185.479, 4.474),
    messier("M62", None, 255.303, -30.114),
    messier("M63", Some("Sunflower Galaxy"), 198.955, 42.029),
    messier("M64", Some("Black Eye Galaxy"), 194.182, 21.683),
    messier("M65", None, 169.733, 13.092),
    messier("M66", None, 170.063, 12.991),
    messier("M67", None, 132.825, 11.817),
    messier("M68", None, 189.867, -26.744),
    messier("M69", None, 277.846, -32.348),
    messier("M70", None, 280.803, -32.292),
    messier("M71", None, 298.444, 18.779),
    messier("M72", None, 313.365, -12.537),
    messier("M73", None, 314.750, -12.633),
    messier("M74", None, 24.174, 15.784),
    messier("M75", None, 301.520, -21.921),
    messier("M76", Some("Little Dumbbell Nebula"), 25.582, 51.575),
    messier("M77", None, 40.670, -0.013),
    messier("M78", None, 86.675, 0.050),
    messier("M79", None, 81.044, -24.524),
    messier("M80", None, 244.260, -22.976),
    messier("M81", Some("Bode's Galaxy"), 148.888, 69.065),
    messier("M82", Some("Cigar Galaxy"), 148.970, 69.680),
    messier("M83", Some("Southern Pinwheel Galaxy"), 204.254, -29.866),
    messier("M84", None, 186.266, 12.887),
    messier("M85", None, 186.350, 18.191),
    messier("M86", None, 186.549, 12.946),
    messier("M87", Some("Virgo A"), 187.706, 12.391),
    messier("M88", None, 187.997, 14.420),
    messier("M89", None, 188.916, 12.556),
    messier("M90", None, 189.209, 13.163),
    messier("M91", None, 188.860, 14.496),
    messier("M92", None, 259.281, 43.136),
    messier("M93", None, 116.150, -23.867),
    messier("M94", None, 192.721, 41.120),
    messier("M95", None, 160.990, 11.704),
    messier("M96", None, 161.690, 11.820),
    messier("M97", Some("Owl Nebula"), 168.699, 55.019),
    messier("M98", None, 183.451, 14.900),
    messier("M99", None, 184.707, 14.417),
    messier("M100", None, 185.729, 15.822),
    messier("M101", Some("Pinwheel Galaxy"), 210.802, 54.349),
    messier("M102", None, 226.623, 55.763),
    messier("M103", None, 23.300, 60.700),
    messier("M104", Some("Sombrero Galaxy"), 189.998, -11.623),
    messier("M105", None, 161.957, 12.582),
    messier("M106", None, 184.740, 47.304),
    messier("M107", None, 248.133, -13.054),
    messier("M108", None, 167.879, 55.674),
    messier("M109", None, 179.400, 53.375),
    messier("M110", None, 10.092, 41.685),
];
