use console::{Emoji, style};

pub static BOOK: Emoji<'_, '_> = Emoji("📖 ", "");
pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");

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

pub fn print_banner() {
    println!();
    println!(
        "{} {}  {}",
        BOOK,
        style("runebook").bold().cyan(),
        style("markdown prompt playbooks for MCP tool servers").dim()
    );
    println!();
}

/// A full-width horizontal rule, dimmed, for separating result sections.
pub fn print_rule(ch: char) {
    println!("{}", style(ch.to_string().repeat(60)).dim());
}

/// One titled block of the command guide printed by `help`.
pub struct GuideSection {
    title: &'static str,
    commands: Vec<(&'static str, &'static str)>,
}

impl GuideSection {
    pub fn new(title: &'static str) -> Self {
        Self {
            title,
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, name: &'static str, blurb: &'static str) -> Self {
        self.commands.push((name, blurb));
        self
    }

    pub fn print(self) {
        println!(" {}", style(self.title).bold().underlined());
        for (name, blurb) in self.commands {
            println!("   {} {}", style(format!("{:<26}", name)).green(), blurb);
        }
        println!();
    }
}
