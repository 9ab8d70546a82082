use std::path::Path;

use super::types::DiskType;

pub const USERCODE_BUNDLE: &str = "robot.zip";
pub const METADATA_FILE: &str = "astoria.json";
pub const UPDATE_BUNDLE: &str = "update.raucb";

/// Pure filesystem predicate over a disk's mount path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// The mount path is a directory containing this file.
    FilePresent(String),
    /// The mount path is a directory with exactly this many entries.
    NumberOfFiles(usize),
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
    Not(Box<Constraint>),
    True,
    False,
}

impl Constraint {
    pub fn file_present(name: impl Into<String>) -> Self {
        Constraint::FilePresent(name.into())
    }

    pub fn and(self, other: Constraint) -> Self {
        Constraint::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Constraint) -> Self {
        Constraint::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Constraint::Not(Box::new(self))
    }

    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Constraint::FilePresent(name) => path.is_dir() && path.join(name).is_file(),
            Constraint::NumberOfFiles(n) => std::fs::read_dir(path)
                .map(|entries| entries.count() == *n)
                .unwrap_or(false),
            Constraint::And(a, b) => a.matches(path) && b.matches(path),
            Constraint::Or(a, b) => a.matches(path) || b.matches(path),
            Constraint::Not(c) => !c.matches(path),
            Constraint::True => true,
            Constraint::False => false,
        }
    }
}

/// Ordered `(DiskType, Constraint)` rules; the first match wins.
#[derive(Debug, Clone)]
pub struct DiskTypeCalculator {
    rules: Vec<(DiskType, Constraint)>,
}

impl DiskTypeCalculator {
    /// The final rule must match everything so classification is total.
    pub fn new(mut rules: Vec<(DiskType, Constraint)>) -> Self {
        if !matches!(rules.last(), Some((_, Constraint::True))) {
            rules.push((DiskType::NoAction, Constraint::True));
        }
        Self { rules }
    }

    pub fn calculate(&self, path: &Path) -> DiskType {
        self.rules
            .iter()
            .find(|(_, constraint)| constraint.matches(path))
            .map(|(disk_type, _)| *disk_type)
            .unwrap_or(DiskType::NoAction)
    }
}

impl Default for DiskTypeCalculator {
    fn default() -> Self {
        Self::new(vec![
            (DiskType::Usercode, Constraint::file_present(USERCODE_BUNDLE)),
            (DiskType::Metadata, Constraint::file_present(METADATA_FILE)),
            (DiskType::Update, Constraint::file_present(UPDATE_BUNDLE)),
            (DiskType::NoAction, Constraint::True),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn disk_with(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            fs::write(dir.path().join(file), b"").unwrap();
        }
        dir
    }

    #[test]
    fn test_classification_order() {
        let calc = DiskTypeCalculator::default();
        assert_eq!(calc.calculate(disk_with(&["robot.zip"]).path()), DiskType::Usercode);
        assert_eq!(calc.calculate(disk_with(&["astoria.json"]).path()), DiskType::Metadata);
        assert_eq!(calc.calculate(disk_with(&["update.raucb"]).path()), DiskType::Update);
        assert_eq!(calc.calculate(disk_with(&["notes.txt"]).path()), DiskType::NoAction);
    }

    #[test]
    fn test_first_rule_wins() {
        let calc = DiskTypeCalculator::default();
        let disk = disk_with(&["robot.zip", "astoria.json", "update.raucb"]);
        assert_eq!(calc.calculate(disk.path()), DiskType::Usercode);
    }

    #[test]
    fn test_missing_path_is_no_action() {
        let calc = DiskTypeCalculator::default();
        assert_eq!(
            calc.calculate(Path::new("/nonexistent/astoria-disk")),
            DiskType::NoAction
        );
    }

    #[test]
    fn test_directory_named_like_marker_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("robot.zip")).unwrap();
        assert!(!Constraint::file_present("robot.zip").matches(dir.path()));
    }

    #[test]
    fn test_combinators() {
        let disk = disk_with(&["a", "b"]);
        let path = disk.path();

        assert!(Constraint::NumberOfFiles(2).matches(path));
        assert!(!Constraint::NumberOfFiles(1).matches(path));
        assert!(Constraint::file_present("a")
            .and(Constraint::file_present("b"))
            .matches(path));
        assert!(Constraint::file_present("z")
            .or(Constraint::file_present("a"))
            .matches(path));
        assert!(Constraint::file_present("z").negate().matches(path));
        assert!(!Constraint::False.matches(path));
    }

    #[test]
    fn test_calculator_is_total() {
        let calc = DiskTypeCalculator::new(vec![(DiskType::Metadata, Constraint::False)]);
        let disk = disk_with(&[]);
        assert_eq!(calc.calculate(disk.path()), DiskType::NoAction);
    }
}
