use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
    Text(String),
    Info(String),
    Warn(String),
    Hint(String, String),
    Blank,
}

/// A titled block of aligned terminal output.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, desc: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), desc.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Info(text.to_string()));
        self
    }

    pub fn warn(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Warn(text.to_string()));
        self
    }

    pub fn hint(mut self, cmd: &str, desc: &str) -> Self {
        self.lines
            .push(GuideLine::Hint(cmd.to_string(), desc.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn render(&self) -> String {
        let width = self
            .lines
            .iter()
            .filter_map(|line| match line {
                GuideLine::Command(name, _) => Some(name.len()),
                GuideLine::Status(label, _) => Some(label.len() + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let mut out = format!("\n {}\n", style(&self.title).bold().underlined());
        for line in &self.lines {
            let rendered = match line {
                GuideLine::Command(name, desc) => format!(
                    "   {}  {}",
                    style(format!("{name:<width$}")).green(),
                    style(desc).dim()
                ),
                GuideLine::Status(label, value) => format!(
                    "   {}  {}",
                    style(format!("{:<width$}", format!("{label}:"))).bold().cyan(),
                    value
                ),
                GuideLine::Text(text) => format!("   {text}"),
                GuideLine::Info(text) => format!("   {}{}", INFO_ICON, style(text).blue()),
                GuideLine::Warn(text) => format!("   {}{}", WARN_ICON, style(text).yellow()),
                GuideLine::Hint(cmd, desc) if desc.is_empty() => {
                    format!("   $ {}", style(cmd).cyan())
                }
                GuideLine::Hint(cmd, desc) => {
                    format!("   $ {}  {}", style(cmd).cyan(), style(desc).dim())
                }
                GuideLine::Blank => String::new(),
            };
            out.push_str(&rendered);
            out.push('\n');
        }
        out
    }

    pub fn print(self) {
        print!("{}", self.render());
    }
}

pub fn print_banner() {
    println!(
        "\n{} {}",
        GEAR,
        style("agentvisor").bold().cyan()
    );
    println!(
        "{}",
        style("Local supervisor for agent processes, schedules and webhooks.").dim()
    );
}
