//! Service Plan Catalog
//!
//! Data bundles, SMS bundles and Bonga points sold through `ServicePurchase`
//! records. A purchase must name a plan and pay exactly its price.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

/// Plan category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PlanCategory {
    Data,
    Sms,
    Bonga,
}

impl PlanCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanCategory::Data => "data",
            PlanCategory::Sms => "sms",
            PlanCategory::Bonga => "bonga",
        }
    }
}

impl fmt::Display for PlanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "data" => Ok(PlanCategory::Data),
            "sms" => Ok(PlanCategory::Sms),
            "bonga" => Ok(PlanCategory::Bonga),
            other => Err(format!(
                "Invalid category '{}'. Must be: data, sms, or bonga",
                other
            )),
        }
    }
}

/// A purchasable plan.
///
/// `quantity` is in the category's unit: megabytes for data, messages for
/// SMS, points for Bonga.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlan {
    #[schema(example = "data2")]
    pub id: &'static str,
    #[schema(example = "Weekly Bundle")]
    pub name: &'static str,
    pub category: PlanCategory,
    #[schema(value_type = String, example = "250")]
    pub price: Decimal,
    pub description: &'static str,
    #[schema(example = 1536)]
    pub quantity: u64,
    /// Days the entitlement stays valid after completion; `None` never expires.
    pub validity_days: Option<u32>,
    pub popular: bool,
}

/// In-process plan catalog
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<ServicePlan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<ServicePlan>) -> Self {
        Self { plans }
    }

    /// The Safaricom bundle line-up sold in the app.
    pub fn standard() -> Self {
        let plan = |id, name, category, price: i64, description, quantity, validity_days, popular| {
            ServicePlan {
                id,
                name,
                category,
                price: Decimal::from(price),
                description,
                quantity,
                validity_days,
                popular,
            }
        };

        Self::new(vec![
            plan("data1", "Daily Bundle", PlanCategory::Data, 50, "100MB + 50MB YouTube", 150, Some(1), false),
            plan("data2", "Weekly Bundle", PlanCategory::Data, 250, "1GB + 500MB YouTube", 1536, Some(7), true),
            plan("data3", "Monthly Bundle", PlanCategory::Data, 1000, "5GB + 2GB YouTube + WhatsApp", 7168, Some(30), false),
            plan("data4", "Super Bundle", PlanCategory::Data, 2000, "15GB + 5GB YouTube + Facebook", 20480, Some(30), false),
            plan("sms1", "SMS 50", PlanCategory::Sms, 30, "50 SMS messages", 50, Some(7), false),
            plan("sms2", "SMS 100", PlanCategory::Sms, 50, "100 SMS messages", 100, Some(14), true),
            plan("sms3", "SMS 500", PlanCategory::Sms, 200, "500 SMS messages", 500, Some(30), false),
            plan("bonga1", "Points Purchase", PlanCategory::Bonga, 100, "Buy Bonga Points", 100, None, false),
            plan("bonga2", "Points Purchase", PlanCategory::Bonga, 500, "Buy Bonga Points", 550, None, true),
            plan("bonga3", "Points Purchase", PlanCategory::Bonga, 1000, "Buy Bonga Points", 1200, None, false),
        ])
    }

    pub fn get(&self, plan_id: &str) -> Option<&ServicePlan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn all(&self) -> &[ServicePlan] {
        &self.plans
    }

    pub fn by_category(&self, category: PlanCategory) -> Vec<ServicePlan> {
        self.plans
            .iter()
            .filter(|p| p.category == category)
            .cloned()
            .collect()
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_contents() {
        let catalog = PlanCatalog::standard();
        assert_eq!(catalog.all().len(), 10);
        assert_eq!(catalog.by_category(PlanCategory::Data).len(), 4);
        assert_eq!(catalog.by_category(PlanCategory::Sms).len(), 3);
        assert_eq!(catalog.by_category(PlanCategory::Bonga).len(), 3);
    }

    #[test]
    fn test_lookup_by_id() {
        let catalog = PlanCatalog::standard();
        let plan = catalog.get("bonga2").unwrap();
        assert_eq!(plan.price, Decimal::from(500));
        assert_eq!(plan.quantity, 550);
        assert_eq!(plan.validity_days, None);
        assert!(catalog.get("data9").is_none());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("SMS".parse::<PlanCategory>(), Ok(PlanCategory::Sms));
        assert!("airtime".parse::<PlanCategory>().is_err());
    }
}
