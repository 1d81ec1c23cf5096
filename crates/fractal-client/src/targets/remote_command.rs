use super::common::shell_quote;

/// A shell command line assembled from quoted words and raw operators, for
/// running through `sh -c` under sudo or on the far side of ssh.
#[derive(Debug, Clone, Default)]
pub struct RemoteCommand {
    words: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            words: vec![program.to_string()],
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.words.push(shell_quote(arg));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.words
            .extend(args.into_iter().map(|a| shell_quote(a.as_ref())));
        self
    }

    /// Appends text without quoting. Only for trusted, preformatted fragments.
    pub fn raw(mut self, fragment: &str) -> Self {
        self.words.push(fragment.to_string());
        self
    }

    pub fn and(self, next: RemoteCommand) -> Self {
        self.joined("&&", next)
    }

    pub fn then(self, next: RemoteCommand) -> Self {
        self.joined(";", next)
    }

    pub fn redirect_out(self, path: &str) -> Self {
        let quoted = shell_quote(path);
        self.raw(">").raw(&quoted)
    }

    fn joined(mut self, operator: &str, next: RemoteCommand) -> Self {
        self.words.push(operator.to_string());
        self.words.extend(next.words);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn to_shell_string(&self) -> String {
        self.words.join(" ")
    }
}

impl From<&str> for RemoteCommand {
    fn from(line: &str) -> Self {
        Self {
            words: vec![line.to_string()],
        }
    }
}
