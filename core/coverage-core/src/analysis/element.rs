use serde::Serialize;

use super::tree::MethodId;

/// Addressable node of a coverage tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKey {
    Package { name: String },
    Class { path: String },
    Method(MethodId),
}

impl ElementKey {
    pub fn package(name: impl Into<String>) -> Self {
        ElementKey::Package { name: name.into() }
    }

    pub fn class(path: impl Into<String>) -> Self {
        ElementKey::Class { path: path.into() }
    }

    /// Stable 16-hex-digit id derived from the element path.
    pub fn id(&self) -> String {
        let source = match self {
            ElementKey::Package { name } => format!("pkg:{}", name),
            ElementKey::Class { path } => format!("cls:{}", path),
            ElementKey::Method(method) => {
                format!("mth:{}.{}{}", method.owner_class, method.name, method.desc)
            }
        };
        format!("{:x}", md5::compute(source.as_bytes()))[..16].to_string()
    }

    pub fn package_name(&self) -> &str {
        match self {
            ElementKey::Package { name } => name,
            ElementKey::Class { path } => package_of(path),
            ElementKey::Method(method) => package_of(&method.owner_class),
        }
    }
}

pub(crate) fn package_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(package, _)| package).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_distinct() {
        let package = ElementKey::package("com/acme");
        let class = ElementKey::class("com/acme");
        assert_eq!(package.id(), ElementKey::package("com/acme").id());
        assert_eq!(package.id(), "0459ac1111835276");
        assert_ne!(package.id(), class.id());
    }

    #[test]
    fn package_name_follows_element() {
        let method = ElementKey::Method(MethodId {
            owner_class: "com/acme/Foo".to_string(),
            name: "run".to_string(),
            desc: "()V".to_string(),
        });
        assert_eq!(method.package_name(), "com/acme");
        assert_eq!(ElementKey::class("Bare").package_name(), "");
    }
}
