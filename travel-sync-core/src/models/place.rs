use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// The persisted form of a place.
///
/// Places known to the mapping service are stored by `placeId` only;
/// anything else is stored as a location plus the query that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LatLng>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl PlaceData {
    pub fn from_place_id(place_id: impl Into<String>) -> Self {
        Self {
            place_id: Some(place_id.into()),
            location: None,
            query: None,
        }
    }

    pub fn from_location(location: LatLng, query: Option<String>) -> Self {
        Self {
            place_id: None,
            location: Some(location),
            query,
        }
    }

    /// Identity used to decide whether two places are the same.
    pub fn to_key(&self) -> String {
        match (&self.place_id, &self.location) {
            (Some(id), _) => id.clone(),
            (None, Some(loc)) => format!(
                "{}({}, {})",
                self.query.as_deref().unwrap_or(""),
                loc.lat,
                loc.lng
            ),
            (None, None) => self.query.clone().unwrap_or_default(),
        }
    }
}

/// A place resolved through the mapping service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub data: PlaceData,
    pub name: Option<String>,
    pub formatted_address: Option<String>,
}

impl Place {
    pub fn new(data: PlaceData) -> Self {
        Self {
            data,
            name: None,
            formatted_address: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_formatted_address(mut self, address: impl Into<String>) -> Self {
        self.formatted_address = Some(address.into());
        self
    }

    pub fn to_data(&self) -> PlaceData {
        self.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_id_serializes_alone() {
        let data = PlaceData::from_place_id("ChIJ123");
        assert_eq!(serde_json::to_string(&data).unwrap(), r#"{"placeId":"ChIJ123"}"#);
    }

    #[test]
    fn test_location_place_roundtrip() {
        let data = PlaceData::from_location(
            LatLng {
                lat: 47.6,
                lng: -122.3,
            },
            Some("coffee".to_string()),
        );
        let json = serde_json::to_string(&data).unwrap();
        let parsed: PlaceData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, data);
        assert!(parsed.to_key().starts_with("coffee"));
    }

    #[test]
    fn test_place_builder() {
        let place = Place::new(PlaceData::from_place_id("p1"))
            .with_name("Space Needle")
            .with_formatted_address("400 Broad St");
        assert_eq!(place.name.as_deref(), Some("Space Needle"));
        assert_eq!(place.to_data().to_key(), "p1");
    }
}
