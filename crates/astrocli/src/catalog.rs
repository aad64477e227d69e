//! The photo catalog the grid scrolls through.
//!
//! The catalog uses the shape of the Mars rover photo manifest:
//!
//! ```json
//! { "photos": [ { "id": 42, "img_src": "http://…", "sol": 1000,
//!                 "earth_date": "2015-05-30", "camera": { "name": "FHAZ" } } ] }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct Camera {
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Rover {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Photo {
    pub id: u64,
    pub img_src: Url,
    pub sol: u32,
    pub earth_date: String,
    pub camera: Camera,
    #[serde(default)]
    pub rover: Option<Rover>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Catalog {
    pub photos: Vec<Photo>,
}

impl Catalog {
    /// Reads a catalog from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read catalog `{}`", path.display()))?;
        Self::from_slice(&data)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("failed to parse catalog")
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Photo> {
        self.photos.iter().find(|photo| photo.id == id)
    }

    /// The download location of every photo, keyed by photo id.
    pub fn locations(&self) -> impl Iterator<Item = (u64, Url)> + '_ {
        self.photos
            .iter()
            .map(|photo| (photo.id, photo.img_src.clone()))
    }
}
