//! Static plan catalog: provider price ids and per-tier quota limits.

use crate::config::PlanConfig;
use crate::models::PremiumTier;

/// Sentinel for quotas with no monthly cap.
pub const UNLIMITED: i64 = -1;

/// Monthly quota limits for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub asset_extractions: i64,
    pub contrast_checks: i64,
    pub lottie_extractions: i64,
    pub ai_generations: i64,
    pub bulk_export: bool,
    pub priority_support: bool,
}

const FREE_LIMITS: PlanLimits = PlanLimits {
    asset_extractions: 15,
    contrast_checks: 3,
    lottie_extractions: 0,
    ai_generations: 0,
    bulk_export: false,
    priority_support: false,
};

const STARTER_LIMITS: PlanLimits = PlanLimits {
    asset_extractions: 500,
    contrast_checks: 50,
    lottie_extractions: 50,
    ai_generations: 50,
    bulk_export: true,
    priority_support: false,
};

const PRO_LIMITS: PlanLimits = PlanLimits {
    asset_extractions: 2000,
    contrast_checks: UNLIMITED,
    lottie_extractions: UNLIMITED,
    ai_generations: UNLIMITED,
    bulk_export: true,
    priority_support: true,
};

/// Maps provider price ids to tiers. Built once from config and passed into
/// the components that need it.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: PlanConfig,
}

impl PlanCatalog {
    pub fn new(plans: PlanConfig) -> Self {
        Self { plans }
    }

    /// Resolve a provider price id to a paid tier. `None` means the price id
    /// is not in the catalog; callers decide how loudly to treat that
    /// (reconciliation logs it and falls back to `Free`).
    pub fn resolve_tier(&self, price_id: &str) -> Option<PremiumTier> {
        if price_id.is_empty() {
            return None;
        }
        if price_id == self.plans.starter_monthly_price_id
            || price_id == self.plans.starter_yearly_price_id
        {
            Some(PremiumTier::Starter)
        } else if price_id == self.plans.pro_monthly_price_id
            || price_id == self.plans.pro_yearly_price_id
        {
            Some(PremiumTier::Pro)
        } else {
            None
        }
    }

    pub fn limits(&self, tier: PremiumTier) -> PlanLimits {
        match tier {
            PremiumTier::Free => FREE_LIMITS,
            PremiumTier::Starter => STARTER_LIMITS,
            PremiumTier::Pro => PRO_LIMITS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_catalog() -> PlanCatalog {
        PlanCatalog::new(PlanConfig {
            starter_monthly_price_id: "price_starter_m".to_string(),
            starter_yearly_price_id: "price_starter_y".to_string(),
            pro_monthly_price_id: "price_pro_m".to_string(),
            pro_yearly_price_id: "price_pro_y".to_string(),
        })
    }

    #[test]
    fn resolves_known_price_ids() {
        let catalog = test_catalog();
        assert_eq!(
            catalog.resolve_tier("price_starter_m"),
            Some(PremiumTier::Starter)
        );
        assert_eq!(
            catalog.resolve_tier("price_starter_y"),
            Some(PremiumTier::Starter)
        );
        assert_eq!(catalog.resolve_tier("price_pro_m"), Some(PremiumTier::Pro));
        assert_eq!(catalog.resolve_tier("price_pro_y"), Some(PremiumTier::Pro));
    }

    #[test]
    fn unknown_price_id_resolves_to_none() {
        let catalog = test_catalog();
        assert_eq!(catalog.resolve_tier("price_renamed"), None);
        assert_eq!(catalog.resolve_tier(""), None);
    }

    #[test]
    fn empty_configured_price_id_never_matches_empty_input() {
        // A misconfigured (empty) catalog entry must not make "" resolve paid.
        let catalog = PlanCatalog::new(PlanConfig {
            starter_monthly_price_id: String::new(),
            starter_yearly_price_id: String::new(),
            pro_monthly_price_id: String::new(),
            pro_yearly_price_id: String::new(),
        });
        assert_eq!(catalog.resolve_tier(""), None);
    }

    #[test]
    fn limits_follow_tier() {
        let catalog = test_catalog();
        assert_eq!(catalog.limits(PremiumTier::Free).asset_extractions, 15);
        assert_eq!(catalog.limits(PremiumTier::Starter).asset_extractions, 500);
        assert_eq!(
            catalog.limits(PremiumTier::Pro).lottie_extractions,
            UNLIMITED
        );
        assert!(catalog.limits(PremiumTier::Pro).priority_support);
    }
}
