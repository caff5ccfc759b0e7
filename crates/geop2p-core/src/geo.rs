// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A fixed geographic position.  Latitude is in [-90, +90], longitude in
/// (-180, +180]; -180 normalises to +180 on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsLocation {
    latitude: f64,
    longitude: f64,
}

impl GpsLocation {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, OverlayError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(OverlayError::InvalidCoordinate(format!(
                "latitude {latitude} outside [-90, 90]"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(OverlayError::InvalidCoordinate(format!(
                "longitude {longitude} outside (-180, 180]"
            )));
        }
        let longitude = if longitude == -180.0 { 180.0 } else { longitude };
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Re-check ranges on a value that crossed the wire.  Serde restores the
    /// raw fields without running the constructor.
    pub fn validate(&self) -> Result<(), OverlayError> {
        Self::new(self.latitude, self.longitude).map(|_| ())
    }
}

impl fmt::Display for GpsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Great-circle (haversine) distance in kilometres.
pub fn distance_km(a: &GpsLocation, b: &GpsLocation) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}
