//! JVM method descriptors rendered for humans.

/// Renders `(ILjava/lang/String;)V` as `(int, String): void`.
///
/// Anything that does not parse as a method descriptor is returned as is.
pub fn declaration(desc: &str) -> String {
    render(desc).unwrap_or_else(|| desc.to_string())
}

fn render(desc: &str) -> Option<String> {
    let rest = desc.strip_prefix('(')?;
    let (params, ret) = rest.split_once(')')?;

    let mut names = Vec::new();
    let mut params = params;
    while !params.is_empty() {
        let (name, tail) = parse_type(params)?;
        names.push(name);
        params = tail;
    }

    let (ret, tail) = parse_type(ret)?;
    if !tail.is_empty() {
        return None;
    }
    Some(format!("({}): {}", names.join(", "), ret))
}

fn parse_type(input: &str) -> Option<(String, &str)> {
    let mut chars = input.chars();
    let head = chars.next()?;
    let tail = chars.as_str();
    let name = match head {
        'B' => "byte",
        'C' => "char",
        'D' => "double",
        'F' => "float",
        'I' => "int",
        'J' => "long",
        'S' => "short",
        'Z' => "boolean",
        'V' => "void",
        'L' => {
            let (path, tail) = tail.split_once(';')?;
            if path.is_empty() {
                return None;
            }
            let simple = path.rsplit('/').next().unwrap_or(path);
            return Some((simple.to_string(), tail));
        }
        '[' => {
            let (element, tail) = parse_type(tail)?;
            return Some((format!("{}[]", element), tail));
        }
        _ => return None,
    };
    Some((name.to_string(), tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_primitives_and_objects() {
        assert_eq!(declaration("(ILjava/lang/String;)V"), "(int, String): void");
        assert_eq!(declaration("()Z"), "(): boolean");
        assert_eq!(
            declaration("([[JLjava/util/List;)[Ljava/lang/Object;"),
            "(long[][], List): Object[]"
        );
    }

    #[test]
    fn leaves_garbage_alone() {
        assert_eq!(declaration("not a descriptor"), "not a descriptor");
        assert_eq!(declaration("(Ljava/lang/String)V"), "(Ljava/lang/String)V");
        assert_eq!(declaration("(I)VV"), "(I)VV");
    }
}
