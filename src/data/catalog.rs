//! Static reference catalog of regions and indicators
//!
//! This module contains the fixed list of regions that can be compared and the
//! economic indicators tracked for each of them, along with their World Bank
//! series codes.

use super::{CalculationMethod, Derivation, Indicator, Region};

/// World Bank series for GDP per capita, PPP (constant international $)
const GDP_PER_CAPITA_SERIES: &str = "NY.GDP.PCAP.PP.KD";

/// World Bank series for the employment to population ratio, 15+ (%)
const EMPLOYMENT_RATE_SERIES: &str = "SL.EMP.TOTL.SP.ZS";

/// Static array of all regions
///
/// BRICS has no aggregate series upstream, so it is served by the sample
/// fallback only.
pub static REGIONS: [Region; 4] = [
    Region {
        id: "EUU",
        name: "European Union",
        remote_source_code: Some("EUU"),
        color: "#3B82F6",
    },
    Region {
        id: "USA",
        name: "United States",
        remote_source_code: Some("US"),
        color: "#EF4444",
    },
    Region {
        id: "CHN",
        name: "China",
        remote_source_code: Some("CN"),
        color: "#F59E0B",
    },
    Region {
        id: "BRC",
        name: "BRICS",
        remote_source_code: None,
        color: "#10B981",
    },
];

/// Static array of all indicators
pub static INDICATORS: [Indicator; 5] = [
    Indicator {
        id: "gdp_per_capita",
        name: "GDP per Capita (PPP)",
        unit: "USD",
        description: "Gross domestic product per capita adjusted for purchasing power parity",
        category: "economic",
        remote_series_code: Some(GDP_PER_CAPITA_SERIES),
        calculation_method: CalculationMethod::Direct,
        derivation: None,
    },
    Indicator {
        id: "real_gdp_growth",
        name: "Real GDP Growth",
        unit: "%",
        description: "Annual percentage growth rate of GDP at constant prices",
        category: "economic",
        remote_series_code: Some("NY.GDP.MKTP.KD.ZG"),
        calculation_method: CalculationMethod::Direct,
        derivation: None,
    },
    Indicator {
        id: "rd_expenditure",
        name: "R&D Expenditure",
        unit: "% of GDP",
        description: "Research and development expenditure as percentage of GDP",
        category: "economic",
        remote_series_code: Some("GB.XPD.RSDV.GD.ZS"),
        calculation_method: CalculationMethod::Direct,
        derivation: None,
    },
    Indicator {
        id: "capital_formation",
        name: "Capital Formation",
        unit: "% of GDP",
        description: "Gross capital formation as percentage of GDP",
        category: "economic",
        remote_series_code: Some("NE.GDI.TOTL.ZS"),
        calculation_method: CalculationMethod::Direct,
        derivation: None,
    },
    Indicator {
        id: "labor_productivity",
        name: "Labor Productivity",
        unit: "USD per employed person",
        description: "GDP per capita divided by employment rate",
        category: "economic",
        remote_series_code: None,
        calculation_method: CalculationMethod::Calculated,
        derivation: Some(Derivation {
            numerator_series: GDP_PER_CAPITA_SERIES,
            denominator_series: EMPLOYMENT_RATE_SERIES,
        }),
    },
];

/// Returns all regions in catalog order
pub fn all_regions() -> &'static [Region] {
    &REGIONS
}

/// Returns all indicators in catalog order
pub fn all_indicators() -> &'static [Indicator] {
    &INDICATORS
}

/// Get a region by its ID
///
/// # Arguments
///
/// * `id` - The stable region code (e.g., "EUU", "USA")
///
/// # Returns
///
/// Returns `Some(&Region)` if found, `None` otherwise
pub fn get_region_by_id(id: &str) -> Option<&'static Region> {
    REGIONS.iter().find(|region| region.id == id)
}

/// Get an indicator by its internal ID
pub fn get_indicator_by_id(id: &str) -> Option<&'static Indicator> {
    INDICATORS.iter().find(|indicator| indicator.id == id)
}
