//! Geographic primitives: great-circle distance and grid-cell keys.
//!
//! Pure functions, no side effects. Distances use the haversine formula on
//! a spherical Earth; cells are axis-aligned squares keyed by the floor of
//! their corner coordinates.

/// Mean Earth radius in miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Approximate miles per degree of latitude.
pub const MILES_PER_DEGREE_LAT: f64 = 69.0;

/// Great-circle distance in miles between two positions.
pub fn distance_miles(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let sin_phi = (d_phi * 0.5).sin();
    let sin_lambda = (d_lambda * 0.5).sin();
    let h = sin_phi * sin_phi + phi1.cos() * phi2.cos() * sin_lambda * sin_lambda;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_MILES * c
}

/// Canonical key of the grid cell containing `(lat, lon)` for cell size
/// `grid_degrees`, rendered to 6 decimal places.
pub fn grid_key(lat: f64, lon: f64, grid_degrees: f64) -> String {
    cell_key(
        (lat / grid_degrees).floor() as i64,
        (lon / grid_degrees).floor() as i64,
        grid_degrees,
    )
}

/// Key of the cell at integer grid indices `(lat_index, lon_index)`.
///
/// Box sweeps must build keys from indices rather than re-flooring
/// `index · grid_degrees`, which can land one cell off after rounding.
pub fn cell_key(lat_index: i64, lon_index: i64, grid_degrees: f64) -> String {
    format!(
        "{:.6},{:.6}",
        lat_index as f64 * grid_degrees,
        lon_index as f64 * grid_degrees
    )
}

/// Latitude half-extent in degrees of a bounding box covering `radius_miles`.
pub fn lat_delta_degrees(radius_miles: f64) -> f64 {
    radius_miles / MILES_PER_DEGREE_LAT
}

/// Longitude half-extent in degrees of a bounding box covering
/// `radius_miles` at latitude `lat`.
pub fn lon_delta_degrees(radius_miles: f64, lat: f64) -> f64 {
    radius_miles / (MILES_PER_DEGREE_LAT * lat.to_radians().cos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_at_same_point() {
        assert_eq!(distance_miles(34.05, -118.25, 34.05, -118.25), 0.0);
    }

    #[test]
    fn la_to_sf_is_about_347_miles() {
        let d = distance_miles(34.0522, -118.2437, 37.7749, -122.4194);
        assert!((d - 347.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn one_degree_of_latitude_is_about_69_miles() {
        let d = distance_miles(34.0, -118.0, 35.0, -118.0);
        assert!((d - 69.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn grid_key_floors_toward_negative_infinity() {
        assert_eq!(grid_key(34.056, -118.257, 0.01), "34.050000,-118.260000");
        assert_eq!(grid_key(-0.005, 0.005, 0.01), "-0.010000,0.000000");
    }

    #[test]
    fn grid_key_is_stable_within_a_cell() {
        let a = grid_key(34.0501, -118.2599, 0.01);
        let b = grid_key(34.0599, -118.2501, 0.01);
        assert_eq!(a, b);
    }

    #[test]
    fn index_keys_match_coordinate_keys() {
        assert_eq!(cell_key(3405, -11826, 0.01), grid_key(34.0501, -118.2599, 0.01));
        assert_eq!(cell_key(-1, 0, 0.01), grid_key(-0.005, 0.005, 0.01));
    }

    #[test]
    fn bounding_box_deltas_widen_with_latitude() {
        let at_equator = lon_delta_degrees(5.0, 0.0);
        let at_45 = lon_delta_degrees(5.0, 45.0);
        assert!(at_45 > at_equator);
        assert!((lat_delta_degrees(69.0) - 1.0).abs() < 1e-9);
    }
}
