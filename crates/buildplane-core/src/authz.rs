//! Authorization seam.
//!
//! Policy evaluation lives behind [`Authorizer`]. Build construction receives
//! a plain `(action, object) -> bool` callback composed with
//! [`with_prebuilt_fallback`].

use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::workspace::{ROLE_OWNER, ROLE_TEMPLATE_ADMIN, Template, User, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Update,
    Delete,
}

/// Identity of a workspace as seen by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceObject {
    pub id: ResourceId,
    pub owner_id: ResourceId,
    pub organization_id: ResourceId,
    pub template_id: ResourceId,
    pub is_prebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Workspace(WorkspaceObject),
    /// A prebuilt workspace acted on as a prebuild rather than as a
    /// workspace owned by the prebuilds system user.
    PrebuiltWorkspace(WorkspaceObject),
    Template {
        id: ResourceId,
        organization_id: ResourceId,
    },
}

impl Object {
    pub fn workspace(workspace: &Workspace) -> Self {
        Object::Workspace(WorkspaceObject {
            id: workspace.id,
            owner_id: workspace.owner_id,
            organization_id: workspace.organization_id,
            template_id: workspace.template_id,
            is_prebuild: workspace.is_prebuild(),
        })
    }

    pub fn template(template: &Template) -> Self {
        Object::Template {
            id: template.id,
            organization_id: template.organization_id,
        }
    }

    /// The prebuilt identity of a prebuilt workspace; `None` for anything else.
    pub fn as_prebuild(&self) -> Option<Object> {
        match self {
            Object::Workspace(ws) if ws.is_prebuild => Some(Object::PrebuiltWorkspace(ws.clone())),
            _ => None,
        }
    }
}

/// The caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user_id: ResourceId,
    pub username: String,
    pub roles: Vec<String>,
}

impl Subject {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl From<&User> for Subject {
    fn from(user: &User) -> Self {
        Subject {
            user_id: user.id,
            username: user.username.clone(),
            roles: user.roles.clone(),
        }
    }
}

/// Policy decision point.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, subject: &Subject, action: Action, object: &Object) -> bool;
}

/// Authorization callback handed to build construction.
pub type AuthorizeFn<'a> = dyn Fn(Action, &Object) -> bool + Send + Sync + 'a;

/// Try the object directly; a denied delete of a prebuilt workspace is
/// retried against its prebuilt identity.
pub fn with_prebuilt_fallback<'a>(
    authorizer: &'a dyn Authorizer,
    subject: &'a Subject,
) -> impl Fn(Action, &Object) -> bool + Send + Sync + 'a {
    move |action, object| {
        if authorizer.authorize(subject, action, object) {
            return true;
        }
        if action == Action::Delete {
            if let Some(prebuilt) = object.as_prebuild() {
                return authorizer.authorize(subject, action, &prebuilt);
            }
        }
        false
    }
}

/// Minimal role-based policy: owners may do anything, users may act on their
/// own workspaces, template admins manage templates and prebuilds and may
/// read any workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleAuthorizer;

impl Authorizer for RoleAuthorizer {
    fn authorize(&self, subject: &Subject, action: Action, object: &Object) -> bool {
        if subject.has_role(ROLE_OWNER) {
            return true;
        }
        match object {
            Object::Workspace(ws) => {
                ws.owner_id == subject.user_id
                    || (action == Action::Read && subject.has_role(ROLE_TEMPLATE_ADMIN))
            }
            Object::PrebuiltWorkspace(_) => subject.has_role(ROLE_TEMPLATE_ADMIN),
            Object::Template { .. } => {
                action == Action::Read || subject.has_role(ROLE_TEMPLATE_ADMIN)
            }
        }
    }
}
