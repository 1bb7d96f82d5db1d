//! `{placeholder}` substitution for configured command lines and paths.

/// Replace every `{key}` in `text` with its value. Unknown placeholders are
/// left as they are.
pub fn render(text: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// [`render`] applied to each argument.
pub fn render_argv(argv: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    argv.iter().map(|arg| render(arg, vars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_known_keys_only() {
        let out = render(
            "dist/{package}-{version}.tar.gz {other}",
            &[("package", "demo"), ("version", "1.2.3")],
        );
        assert_eq!(out, "dist/demo-1.2.3.tar.gz {other}");
    }

    #[test]
    fn test_render_argv_keeps_arity() {
        let argv = vec!["pip".to_string(), "install".to_string(), "{spec}".to_string()];
        assert_eq!(
            render_argv(&argv, &[("spec", "demo[audio]==1.0.0")]),
            ["pip", "install", "demo[audio]==1.0.0"]
        );
    }
}
