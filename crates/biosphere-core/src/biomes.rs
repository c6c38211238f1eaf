//! Catalogue of BioSphere 2 locations and their environmental baselines

/// A biome and the baseline its environment and scene effects derive from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biome {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub base_temp: f64,
    pub base_humidity: f64,
    pub light_intensity: f64,
    pub fog_density: f64,
    pub color_tint: [f64; 3],
}

pub const BIOMES: [Biome; 4] = [
    Biome {
        id: "desert",
        name: "Desert",
        description: "The Desert biome in BioSphere 2 is a hot, arid environment with low precipitation and high temperature variability.",
        base_temp: 30.0,
        base_humidity: 30.0,
        light_intensity: 1.2,
        fog_density: 0.1,
        color_tint: [1.0, 0.8, 0.6],
    },
    Biome {
        id: "rainforest",
        name: "Rainforest",
        description: "The Rainforest biome in BioSphere 2 is a humid, tropical environment with diverse plant species and complex vertical stratification.",
        base_temp: 28.0,
        base_humidity: 85.0,
        light_intensity: 0.8,
        fog_density: 0.3,
        color_tint: [0.6, 0.8, 0.6],
    },
    Biome {
        id: "ocean",
        name: "Ocean",
        description: "The Ocean biome in BioSphere 2 is a saltwater environment with a coral reef ecosystem, containing various marine organisms.",
        base_temp: 25.0,
        base_humidity: 90.0,
        light_intensity: 0.9,
        fog_density: 0.4,
        color_tint: [0.6, 0.7, 0.9],
    },
    Biome {
        id: "leo-w",
        name: "LEO-W",
        description: "The LEO-W (Landscape Evolution Observatory - West) is a controlled environment for studying how landscapes evolve under different conditions.",
        base_temp: 22.0,
        base_humidity: 70.0,
        light_intensity: 1.0,
        fog_density: 0.2,
        color_tint: [0.8, 0.8, 0.8],
    },
];

impl Biome {
    /// Find a biome by id or display name, ignoring case and separators
    pub fn lookup(location: &str) -> Option<Biome> {
        let key = normalize(location);
        BIOMES
            .iter()
            .find(|b| normalize(b.id) == key || normalize(b.name) == key)
            .copied()
    }

    /// Baseline used for locations outside the catalogue
    pub fn fallback() -> Biome {
        BIOMES[3]
    }

    /// Detect the first biome mentioned in free text
    pub fn mentioned_in(text: &str) -> Option<Biome> {
        let lower = text.to_lowercase();
        let squashed = normalize(&lower);
        BIOMES
            .iter()
            .find(|b| lower.contains(&b.name.to_lowercase()) || squashed.contains(&normalize(b.id)))
            .copied()
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
