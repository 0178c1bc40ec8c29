//! HTML pages rendered from the minijinja templates under `templates/`.

use minijinja::{context, AutoEscape, Environment, Error};

use crate::auth::User;
use crate::control::SystemStatus;

const BASE: &str = include_str!("../templates/base.html");
const LOGIN: &str = include_str!("../templates/login.html");
const DASHBOARD: &str = include_str!("../templates/dashboard.html");

fn template_source(name: &str) -> Option<&'static str> {
    match name {
        "base.html" => Some(BASE),
        "login.html" => Some(LOGIN),
        "dashboard.html" => Some(DASHBOARD),
        _ => None,
    }
}

/// Template environment for the login page and the dashboard
pub struct Pages {
    env: Environment<'static>,
}

impl Default for Pages {
    fn default() -> Self {
        Self::new()
    }
}

impl Pages {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.set_loader(|name| Ok(template_source(name).map(str::to_string)));
        Self { env }
    }

    /// Renders the login form
    /// param error: message shown above the form
    /// param next: page to return to after logging in
    pub fn login(&self, error: Option<&str>, next: Option<&str>) -> Result<String, Error> {
        self.env
            .get_template("login.html")?
            .render(context! { error, next })
    }

    /// Renders the dashboard; admins get the control buttons
    pub fn dashboard(&self, status: &SystemStatus, user: &User) -> Result<String, Error> {
        self.env
            .get_template("dashboard.html")?
            .render(context! { status, user })
    }
}
