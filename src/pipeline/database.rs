//! The database of root actions.
//!
//! A single *universal* action holds every sub-action and rule known to
//! the build. Root actions (what the driver actually runs) are derived
//! from it by cloning against a group list. The database tracks one
//! *current* root; per-function copies are cloned from it so concurrent
//! analyses never share mutable action state.

use rustc_hash::FxHashMap;

use crate::{
    func::Funcdata,
    pipeline::action::{Action, ActionBody, ActionFlags},
    program::Architecture,
    rules::{universal_rules, RulePool},
    Error, Result,
};

/// Name of the universal root action.
pub const UNIVERSAL_NAME: &str = "universal";

fn action_start(fd: &mut Funcdata) -> Result<bool> {
    if !fd.is_started() {
        fd.start_processing();
    }
    Ok(false)
}

fn action_heritage(fd: &mut Funcdata) -> Result<bool> {
    fd.op_heritage()
}

fn action_nzmask(fd: &mut Funcdata) -> Result<bool> {
    fd.calc_nzmask();
    Ok(false)
}

fn action_deadcode(fd: &mut Funcdata) -> Result<bool> {
    fd.eliminate_dead_code()
}

fn action_unreachable(fd: &mut Funcdata) -> Result<bool> {
    if !fd
        .flags()
        .contains(crate::func::FunctionFlags::BLOCKS_GENERATED)
    {
        return Ok(false);
    }
    fd.remove_unreachable_blocks(true)
}

fn action_params(fd: &mut Funcdata) -> Result<bool> {
    fd.recover_parameters()
}

fn action_types(fd: &mut Funcdata) -> Result<bool> {
    fd.recover_types()
}

fn action_casts(fd: &mut Funcdata) -> Result<bool> {
    fd.insert_casts()
}

fn action_merge(fd: &mut Funcdata) -> Result<bool> {
    fd.build_high_variables()
}

fn action_structure(fd: &mut Funcdata) -> Result<bool> {
    if !fd
        .flags()
        .contains(crate::func::FunctionFlags::BLOCKS_GENERATED)
    {
        return Ok(false);
    }
    let result = fd.structure_control_flow()?;
    fd.structure = Some(result);
    Ok(false)
}

fn action_cleanup(fd: &mut Funcdata) -> Result<bool> {
    fd.start_clean_up();
    fd.eliminate_dead_code()
}

/// Builds the universal action containing every sub-action and rule.
fn build_universal(arch: &Architecture) -> Action {
    let mut pool = RulePool::new();
    for rule in universal_rules() {
        pool.add_rule(rule);
    }

    let mainloop = Action::new(
        "mainloop",
        "base",
        ActionFlags::REPEAT_APPLY,
        ActionBody::Group(vec![
            Action::new(
                "heritage",
                "base",
                ActionFlags::empty(),
                ActionBody::Leaf(action_heritage),
            ),
            Action::new(
                "nzmask",
                "analysis",
                ActionFlags::empty(),
                ActionBody::Leaf(action_nzmask),
            ),
            Action::new("oppool", "base", ActionFlags::empty(), ActionBody::Pool(pool)),
            Action::new(
                "unreachable",
                "analysis",
                ActionFlags::empty(),
                ActionBody::Leaf(action_unreachable),
            ),
            Action::new(
                "deadcode",
                "base",
                ActionFlags::empty(),
                ActionBody::Leaf(action_deadcode),
            ),
        ]),
    );

    Action::new(
        UNIVERSAL_NAME,
        "base",
        ActionFlags::empty(),
        ActionBody::RestartGroup {
            list: vec![
                Action::new(
                    "start",
                    "base",
                    ActionFlags::ONCE_PER_FUNC,
                    ActionBody::Leaf(action_start),
                ),
                mainloop,
                Action::new(
                    "params",
                    "protorecovery",
                    ActionFlags::empty(),
                    ActionBody::Leaf(action_params),
                ),
                Action::new(
                    "typerecovery",
                    "typerecovery",
                    ActionFlags::empty(),
                    ActionBody::Leaf(action_types),
                ),
                Action::new(
                    "merge",
                    "merge",
                    ActionFlags::empty(),
                    ActionBody::Leaf(action_merge),
                ),
                Action::new(
                    "structure",
                    "blockrecovery",
                    ActionFlags::empty(),
                    ActionBody::Leaf(action_structure),
                ),
                Action::new(
                    "casts",
                    "casts",
                    ActionFlags::empty(),
                    ActionBody::Leaf(action_casts),
                ),
                Action::new(
                    "cleanup",
                    "cleanup",
                    ActionFlags::empty(),
                    ActionBody::Leaf(action_cleanup),
                ),
            ],
            max_restarts: arch.limits().max_restarts,
            restarts: 0,
        },
    )
}

/// Container and selector for root actions.
pub struct ActionDatabase {
    universal: Action,
    roots: FxHashMap<String, Vec<String>>,
    current: String,
}

impl ActionDatabase {
    /// Builds the database with the built-in universal action and the
    /// standard root set; `decompile` starts current.
    #[must_use]
    pub fn with_universal(arch: &Architecture) -> Self {
        let mut roots = FxHashMap::default();
        roots.insert(
            "decompile".to_string(),
            vec![
                "base".to_string(),
                "analysis".to_string(),
                "protorecovery".to_string(),
                "typerecovery".to_string(),
                "merge".to_string(),
                "blockrecovery".to_string(),
                "casts".to_string(),
                "cleanup".to_string(),
            ],
        );
        roots.insert(
            "normalize".to_string(),
            vec!["base".to_string(), "analysis".to_string()],
        );
        roots.insert(
            "jumptable".to_string(),
            vec!["base".to_string(), "analysis".to_string()],
        );
        Self {
            universal: build_universal(arch),
            roots,
            current: "decompile".to_string(),
        }
    }

    /// Returns the universal action.
    #[must_use]
    pub const fn universal(&self) -> &Action {
        &self.universal
    }

    /// Returns the name of the current root action.
    #[must_use]
    pub fn current_name(&self) -> &str {
        &self.current
    }

    /// Selects the current root action by name.
    ///
    /// # Errors
    ///
    /// Fails if no root with that name is registered.
    pub fn set_current(&mut self, name: &str) -> Result<()> {
        if !self.roots.contains_key(name) {
            return Err(Error::ConfigError(format!("unknown root action '{name}'")));
        }
        self.current = name.to_string();
        Ok(())
    }

    /// Registers (or replaces) a root action as a group list.
    pub fn register_root(&mut self, name: &str, groups: Vec<String>) {
        self.roots.insert(name.to_string(), groups);
    }

    /// Returns the group list of a root.
    #[must_use]
    pub fn group_list(&self, name: &str) -> Option<&[String]> {
        self.roots.get(name).map(Vec::as_slice)
    }

    /// Derives a fresh root action by name, cloned and filtered from the
    /// universal action.
    ///
    /// # Errors
    ///
    /// Fails for an unknown name or a group list that filters everything.
    pub fn derive_root(&self, name: &str) -> Result<Action> {
        let groups = self
            .roots
            .get(name)
            .ok_or_else(|| Error::ConfigError(format!("unknown root action '{name}'")))?;
        self.universal
            .clone_filtered(groups)
            .ok_or_else(|| Error::ConfigError(format!("root action '{name}' is empty")))
    }

    /// Clones the current root for one function's analysis.
    ///
    /// # Errors
    ///
    /// Propagates [`ActionDatabase::derive_root`] failures.
    pub fn current_for_function(&self) -> Result<Action> {
        self.derive_root(&self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    #[test]
    fn test_database_roots() {
        let arch = test_arch();
        let db = ActionDatabase::with_universal(&arch);
        assert_eq!(db.current_name(), "decompile");
        assert!(db.derive_root("decompile").is_ok());
        assert!(db.derive_root("normalize").is_ok());
        assert!(db.derive_root("bogus").is_err());
    }

    #[test]
    fn test_set_current_validates() {
        let arch = test_arch();
        let mut db = ActionDatabase::with_universal(&arch);
        assert!(db.set_current("normalize").is_ok());
        assert_eq!(db.current_name(), "normalize");
        assert!(db.set_current("bogus").is_err());
    }

    #[test]
    fn test_normalize_root_drops_structuring() {
        let arch = test_arch();
        let db = ActionDatabase::with_universal(&arch);
        let root = db.derive_root("normalize").unwrap();
        assert!(root.sub_action("structure").is_none());
        assert!(root.sub_action("merge").is_none());
        assert!(root.sub_action("heritage").is_some());
    }

    #[test]
    fn test_custom_root_registration() {
        let arch = test_arch();
        let mut db = ActionDatabase::with_universal(&arch);
        db.register_root("minimal", vec!["base".to_string()]);
        let root = db.derive_root("minimal").unwrap();
        assert!(root.sub_action("heritage").is_some());
        assert!(root.sub_action("nzmask").is_none());
    }

    #[test]
    fn test_per_function_clones_are_independent() {
        let arch = test_arch();
        let db = ActionDatabase::with_universal(&arch);
        let a = db.current_for_function().unwrap();
        let b = db.current_for_function().unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(a.num_tests(), 0);
        assert_eq!(b.num_tests(), 0);
    }
}
