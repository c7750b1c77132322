//! Extension pour intégrer la configuration du résolveur dans pmoconfig

use anyhow::Result;
use pmoconfig::Config;

use crate::resolver::ResolverOptions;

/// Trait d'extension pour les clés `resolver.*`
pub trait ResolverConfigExt {
    fn get_resolver_options(&self) -> ResolverOptions;

    /// Définit le nombre maximal de résultats par requête
    fn set_resolver_max_results(&self, max_results: usize) -> Result<()>;
}

impl ResolverConfigExt for Config {
    fn get_resolver_options(&self) -> ResolverOptions {
        let defaults = ResolverOptions::default();
        ResolverOptions {
            name: self.get_string(&["resolver", "name"], &defaults.name),
            weight: u32::try_from(self.get_u64(&["resolver", "weight"], u64::from(defaults.weight)))
                .unwrap_or(defaults.weight),
            target_time_ms: self.get_u64(&["resolver", "target_time_ms"], defaults.target_time_ms),
            local_only: self.get_bool(&["resolver", "local_only"], defaults.local_only),
            source: self.get_string(&["resolver", "source"], &defaults.source),
            max_results: self.get_usize(&["resolver", "max_results"], defaults.max_results),
        }
    }

    fn set_resolver_max_results(&self, max_results: usize) -> Result<()> {
        self.set_u64(&["resolver", "max_results"], max_results as u64)
    }
}
