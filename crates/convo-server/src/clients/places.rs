use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use super::{check, transport};
use crate::error::ServerError;

/// Resolved venue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Place {
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    /// Minutes east of UTC.
    pub utc_offset: i32,
}

#[async_trait]
pub trait Places: Send + Sync {
    async fn details(&self, place_id: &str) -> Result<Place, ServerError>;
}

/// Place-details endpoint returning `{status, result: {formatted_address,
/// geometry: {location: {lat, lng}}, utc_offset}}`.
pub struct HttpPlaces {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpPlaces {
    pub fn new(http: reqwest::Client, url: &str, api_key: String) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<DetailsResult>,
}

#[derive(Deserialize)]
struct DetailsResult {
    #[serde(default)]
    formatted_address: String,
    geometry: Geometry,
    #[serde(default)]
    utc_offset: i32,
}

#[derive(Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl Places for HttpPlaces {
    async fn details(&self, place_id: &str) -> Result<Place, ServerError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("placeid", place_id), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(transport("places"))?;
        let body: DetailsResponse = check("places", response)
            .await?
            .json()
            .await
            .map_err(transport("places"))?;
        match (body.status.as_str(), body.result) {
            ("OK", Some(result)) => Ok(Place {
                address: result.formatted_address,
                lat: result.geometry.location.lat,
                lng: result.geometry.location.lng,
                utc_offset: result.utc_offset,
            }),
            ("NOT_FOUND" | "INVALID_REQUEST", _) => {
                Err(ServerError::invalid("place_id", "We could not find that place"))
            }
            (status, _) => Err(ServerError::external("places", status)),
        }
    }
}

/// Fixed table of places. Unknown IDs resolve to an empty address.
#[derive(Default)]
pub struct StaticPlaces {
    places: HashMap<String, Place>,
}

impl StaticPlaces {
    pub fn with(mut self, place_id: &str, place: Place) -> Self {
        self.places.insert(place_id.to_string(), place);
        self
    }
}

#[async_trait]
impl Places for StaticPlaces {
    async fn details(&self, place_id: &str) -> Result<Place, ServerError> {
        Ok(self.places.get(place_id).cloned().unwrap_or_default())
    }
}
