use std::collections::HashMap;
use std::env::{
    self,
    VarError,
};
use std::ffi::{
    OsStr,
    OsString,
};
use std::path::PathBuf;
use std::sync::{
    Arc,
    Mutex,
};

/// Access to the process environment.
///
/// Harness configuration is resolved through an [Env] rather than [std::env] so that tests can
/// describe an environment with [Env::from_slice] instead of mutating the real one, which is
/// shared by every test thread in the binary.
#[derive(Debug, Clone, Default)]
pub struct Env(inner::Inner);

mod inner {
    use std::collections::HashMap;
    use std::sync::{
        Arc,
        Mutex,
    };

    #[derive(Debug, Clone, Default)]
    pub(super) enum Inner {
        #[default]
        Real,
        Fake(Arc<Mutex<Fake>>),
    }

    #[derive(Debug, Clone, Default)]
    pub(super) struct Fake {
        pub vars: HashMap<String, String>,
    }
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fake process environment from a slice of tuples.
    pub fn from_slice(vars: &[(&str, &str)]) -> Self {
        use inner::Inner;
        let map: HashMap<_, _> = vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        Self(Inner::Fake(Arc::new(Mutex::new(inner::Fake { vars: map }))))
    }

    pub fn get<K: AsRef<str>>(&self, key: K) -> Result<String, VarError> {
        use inner::Inner;
        match &self.0 {
            Inner::Real => env::var(key.as_ref()),
            Inner::Fake(fake) => fake
                .lock()
                .unwrap()
                .vars
                .get(key.as_ref())
                .cloned()
                .ok_or(VarError::NotPresent),
        }
    }

    pub fn get_os<K: AsRef<OsStr>>(&self, key: K) -> Option<OsString> {
        use inner::Inner;
        match &self.0 {
            Inner::Real => env::var_os(key.as_ref()),
            Inner::Fake(fake) => fake
                .lock()
                .unwrap()
                .vars
                .get(key.as_ref().to_str()?)
                .cloned()
                .map(OsString::from),
        }
    }

    /// Returns the variable as a path, treating an empty value the same as an unset one.
    pub fn get_path<K: AsRef<OsStr>>(&self, key: K) -> Option<PathBuf> {
        self.get_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
    }
}
