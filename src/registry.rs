// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in coterie modules and VPN provider metadata
//!
//! Modules ship inside the binary; a provider or hardware family is added by
//! dropping a file in `coteries/` and listing it here.

/// A coterie module compiled into the binary
#[derive(Debug, Clone, Copy)]
pub struct BuiltinModule {
    /// Module id (also the file stem under `coteries/`)
    pub id: &'static str,
    /// TOML source
    pub source: &'static str,
}

/// A credential the operator supplies for a provider
#[derive(Debug, Clone, Copy)]
pub struct CredentialField {
    /// Router attribute the value is stored under
    pub attribute: &'static str,
    /// Prompt text
    pub hint: &'static str,
    /// Must be non-empty
    pub required: bool,
    /// Masked in the prompt summary
    pub secret: bool,
}

/// A supported VPN provider
#[derive(Debug, Clone, Copy)]
pub struct Provider {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Website without scheme, for display
    pub website: &'static str,
    pub url: &'static str,
    pub credentials: &'static [CredentialField],
}

pub const BUILTIN_MODULES: &[BuiltinModule] = &[
    BuiltinModule {
        id: "gl-ar300m",
        source: include_str!("../coteries/gl-ar300m.toml"),
    },
    BuiltinModule {
        id: "mullvad",
        source: include_str!("../coteries/mullvad.toml"),
    },
    BuiltinModule {
        id: "privateinternetaccess",
        source: include_str!("../coteries/privateinternetaccess.toml"),
    },
];

pub const PROVIDERS: &[Provider] = &[
    Provider {
        id: "mullvad",
        display_name: "Mullvad VPN",
        website: "mullvad.net",
        url: "https://mullvad.net/en/",
        credentials: &[
            CredentialField {
                attribute: "vpn_account",
                hint: "Account number",
                required: true,
                secret: false,
            },
            CredentialField {
                attribute: "vpn_comment",
                hint: "Comment (optional)",
                required: false,
                secret: false,
            },
        ],
    },
    Provider {
        id: "privateinternetaccess",
        display_name: "Private Internet Access",
        website: "privateinternetaccess.com",
        url: "https://www.privateinternetaccess.com/",
        credentials: &[
            CredentialField {
                attribute: "vpn_user",
                hint: "Username (usually p1234567)",
                required: true,
                secret: false,
            },
            CredentialField {
                attribute: "vpn_password",
                hint: "Password",
                required: true,
                secret: true,
            },
            CredentialField {
                attribute: "vpn_comment",
                hint: "Comment (optional)",
                required: false,
                secret: false,
            },
        ],
    },
];

/// Look up a provider by id
pub fn provider(id: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|p| p.id == id)
}
