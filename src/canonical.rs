// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Canonical metric vocabulary
//!
//! Different ECUs, scan tools and log formats name the same quantity
//! differently (`Oil_Pressure`, `OilPressure`, `ENGINE_OIL_PRESSURE`...).
//! [`MetricVocabulary`] folds them onto a single canonical name so each
//! physical quantity has exactly one time series downstream.
//!
//! The vocabulary is immutable after construction; lookups are pure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical metric names used by the default tables.
pub mod metrics {
    pub const ENGINE_RPM: &str = "Engine_RPM";
    pub const VEHICLE_SPEED: &str = "Vehicle_Speed";
    pub const COOLANT_TEMP: &str = "Coolant_Temp";
    pub const OIL_PRESSURE: &str = "Oil_Pressure";
    pub const OIL_TEMP: &str = "Oil_Temp";
    pub const BATTERY_VOLTAGE: &str = "Battery_Voltage";
    pub const INTAKE_AIR_TEMP: &str = "Intake_Air_Temp";
    pub const ENGINE_LOAD: &str = "Engine_Load";
    pub const THROTTLE_POSITION: &str = "Throttle_Position";
    pub const FUEL_LEVEL: &str = "Fuel_Level";
    pub const FUEL_PRESSURE: &str = "Fuel_Pressure";
    pub const MAF: &str = "MAF";
}

use metrics::*;

/// Alias table plus the unit each canonical metric is reported in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricVocabulary {
    /// Raw name -> canonical name
    aliases: HashMap<String, String>,
    /// Canonical name -> unit
    units: HashMap<String, String>,
}

impl MetricVocabulary {
    /// An empty vocabulary: every name maps to itself, no units.
    pub fn empty() -> Self {
        Self {
            aliases: HashMap::new(),
            units: HashMap::new(),
        }
    }

    /// Add aliases for a canonical metric (builder style).
    pub fn with_aliases<I, S>(mut self, canonical: &str, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for alias in aliases {
            self.aliases.insert(alias.into(), canonical.to_string());
        }
        self
    }

    /// Set the unit of a canonical metric (builder style).
    pub fn with_unit(mut self, canonical: &str, unit: impl Into<String>) -> Self {
        self.units.insert(canonical.to_string(), unit.into());
        self
    }

    /// Map a raw metric name onto its canonical name.
    ///
    /// Unknown names pass through unchanged.
    pub fn canonical_metric<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Unit for a canonical metric, empty if unknown.
    pub fn unit_for(&self, canonical: &str) -> &str {
        self.units.get(canonical).map(String::as_str).unwrap_or("")
    }

    /// Number of aliases registered
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}

impl Default for MetricVocabulary {
    fn default() -> Self {
        Self::empty()
            .with_aliases(
                ENGINE_RPM,
                ["RPM", "EngineRPM", "Engine_Speed", "ENGINE_RPM", "engine_rpm", "Engine RPM(rpm)"],
            )
            .with_unit(ENGINE_RPM, "rpm")
            .with_aliases(
                VEHICLE_SPEED,
                ["Speed", "VehicleSpeed", "VEHICLE_SPEED", "vehicle_speed", "Speed (OBD)(km/h)"],
            )
            .with_unit(VEHICLE_SPEED, "km/h")
            .with_aliases(
                COOLANT_TEMP,
                [
                    "CoolantTemp",
                    "Engine_Coolant_Temp",
                    "ECT",
                    "COOLANT_TEMP",
                    "coolant_temp",
                    "Engine Coolant Temperature(°C)",
                ],
            )
            .with_unit(COOLANT_TEMP, "°C")
            .with_aliases(
                OIL_PRESSURE,
                ["OilPressure", "Engine_Oil_Pressure", "ENGINE_OIL_PRESSURE", "oil_pressure"],
            )
            .with_unit(OIL_PRESSURE, "psi")
            .with_aliases(OIL_TEMP, ["OilTemp", "Engine_Oil_Temp", "oil_temp"])
            .with_unit(OIL_TEMP, "°C")
            .with_aliases(
                BATTERY_VOLTAGE,
                [
                    "BatteryVoltage",
                    "Battery",
                    "Control_Module_Voltage",
                    "battery_voltage",
                    "Voltage (Control Module)(V)",
                ],
            )
            .with_unit(BATTERY_VOLTAGE, "V")
            .with_aliases(
                INTAKE_AIR_TEMP,
                ["IAT", "IntakeAirTemp", "intake_air_temp", "Intake Air Temperature(°C)"],
            )
            .with_unit(INTAKE_AIR_TEMP, "°C")
            .with_aliases(
                ENGINE_LOAD,
                ["EngineLoad", "Calculated_Load", "engine_load", "Engine Load(%)"],
            )
            .with_unit(ENGINE_LOAD, "%")
            .with_aliases(
                THROTTLE_POSITION,
                ["ThrottlePosition", "TPS", "throttle_position", "Throttle Position(Manifold)(%)"],
            )
            .with_unit(THROTTLE_POSITION, "%")
            .with_aliases(
                FUEL_LEVEL,
                ["FuelLevel", "fuel_level", "Fuel Level (From Engine ECU)(%)"],
            )
            .with_unit(FUEL_LEVEL, "%")
            .with_aliases(FUEL_PRESSURE, ["FuelPressure", "Fuel_Rail_Pressure", "fuel_pressure"])
            .with_unit(FUEL_PRESSURE, "kPa")
            .with_aliases(MAF, ["MassAirFlow", "Mass_Air_Flow", "maf"])
            .with_unit(MAF, "g/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_synonyms_collapse() {
        let vocab = MetricVocabulary::default();
        assert_eq!(vocab.canonical_metric("Oil_Pressure"), "Oil_Pressure");
        assert_eq!(vocab.canonical_metric("OilPressure"), "Oil_Pressure");
        assert_eq!(vocab.canonical_metric("ENGINE_OIL_PRESSURE"), "Oil_Pressure");
        assert_eq!(vocab.canonical_metric("ECT"), "Coolant_Temp");
    }

    #[test]
    fn test_unknown_name_passes_through() {
        let vocab = MetricVocabulary::default();
        assert_eq!(vocab.canonical_metric("Boost_Pressure"), "Boost_Pressure");
        assert_eq!(vocab.unit_for("Boost_Pressure"), "");
    }

    #[test]
    fn test_lookup_is_pure() {
        let vocab = MetricVocabulary::default();
        let first = vocab.canonical_metric("RPM").to_string();
        let second = vocab.canonical_metric("RPM").to_string();
        assert_eq!(first, second);
        assert_eq!(vocab.unit_for(&first), "rpm");
    }

    #[test]
    fn test_custom_vocabulary() {
        let vocab = MetricVocabulary::empty()
            .with_aliases("Boost", ["BoostPressure", "MAP_Boost"])
            .with_unit("Boost", "kPa");
        assert_eq!(vocab.canonical_metric("MAP_Boost"), "Boost");
        assert_eq!(vocab.unit_for("Boost"), "kPa");
        assert_eq!(vocab.alias_count(), 2);
    }
}
