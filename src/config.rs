//! Target configuration consumed by the lowering pipeline.
//!
//! These knobs are supplied by the driver and are read-only here. They
//! correspond to the compilation-wide decisions that gate widening and
//! heap promotion: whether the build targets a single locale, which
//! communication substrate backs remote access, and whether runtime
//! locale-equality checks are emitted.

/// How many memory domains the compiled program may span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocaleModel {
    /// Everything runs in one memory domain; widening is disabled wholesale.
    Single,
    /// The general distributed configuration.
    #[default]
    Multi,
}

/// The communication substrate the runtime is built against.
///
/// Some substrates register the whole address space for remote access, in
/// which case locals never need to migrate to the heap even in multi-locale
/// builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommLayer {
    #[default]
    Generic,
    /// Registered-memory NIC; the full segment is remotely addressable.
    Ugni,
    /// Gasnet with the given segment configuration.
    Gasnet { segment_everything: bool },
}

#[derive(Debug, Clone, Default)]
pub struct TargetConfig {
    pub locales: LocaleModel,
    pub comm: CommLayer,
    /// Skip runtime locale-equality checks inside `local` regions.
    pub no_local_checks: bool,
}

impl TargetConfig {
    pub fn single_locale() -> Self {
        Self { locales: LocaleModel::Single, ..Self::default() }
    }

    pub fn multi_locale() -> Self {
        Self { locales: LocaleModel::Multi, ..Self::default() }
    }

    /// Whether class and reference types must be rewritten to their wide
    /// (locale + address) counterparts.
    pub fn require_wide_refs(&self) -> bool {
        self.locales == LocaleModel::Multi
    }

    /// Whether locals whose address crosses an `on` boundary must migrate
    /// to the heap. False when the substrate can address the whole segment
    /// remotely.
    pub fn need_heap_vars(&self) -> bool {
        if self.locales == LocaleModel::Single {
            return false;
        }
        match self.comm {
            CommLayer::Ugni => false,
            CommLayer::Gasnet { segment_everything } => !segment_everything,
            CommLayer::Generic => true,
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    #[test]
    fn heap_vars_follow_comm_layer() {
        let mut cfg = TargetConfig::multi_locale();
        assert!(cfg.require_wide_refs());
        assert!(cfg.need_heap_vars());

        cfg.comm = CommLayer::Ugni;
        assert!(cfg.require_wide_refs());
        assert!(!cfg.need_heap_vars());

        cfg.comm = CommLayer::Gasnet { segment_everything: true };
        assert!(!cfg.need_heap_vars());
        cfg.comm = CommLayer::Gasnet { segment_everything: false };
        assert!(cfg.need_heap_vars());

        assert!(!TargetConfig::single_locale().need_heap_vars());
        assert!(!TargetConfig::single_locale().require_wide_refs());
    }
}
