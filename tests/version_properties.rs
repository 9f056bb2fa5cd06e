// SPDX-License-Identifier: AGPL-3.0-or-later
//! Property tests for version bookkeeping and coterie ordering

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bitburrow::config::Router;
use bitburrow::coterie::{elect, CoterieModule};
use proptest::prelude::*;

fn blank_router() -> Router {
    Router {
        ip: Ipv4Addr::new(192, 168, 8, 1),
        mac: "94:83:c4:00:00:01".to_string(),
        nickname: "GL.iNet 00:01".to_string(),
        host_key: None,
        root_password: "password".to_string(),
        wifi_password: "password".to_string(),
        wifi_ssid: None,
        wifi_join_password: None,
        ssh_public_key: "ssh-ed25519 AAAA test".to_string(),
        ssh_private_key: String::new(),
        hardware: "gl-ar300m".to_string(),
        provider: None,
        attributes: BTreeMap::new(),
        coterie_versions: BTreeMap::new(),
        connected_via: None,
    }
}

fn module_source(sorts: &[i64]) -> String {
    let mut text = String::from(
        "tag = \"coterie-module\"\nkind = \"hardware\"\nprotocol = \"openwrt\"\ndisplay_name = \"Generated\"\n",
    );
    for (i, sort) in sorts.iter().enumerate() {
        text.push_str(&format!(
            "\n[[coteries]]\ntag = \"coterie\"\nid = \"c{i}\"\nversion = \"0->1\"\nsort = {sort}\ntype = \"commands\"\ndata = \"true\\n\"\n"
        ));
    }
    text
}

proptest! {
    #[test]
    fn recorded_versions_never_decrease(
        updates in prop::collection::vec((0usize..4, 0u32..20), 1..40)
    ) {
        let ids = ["dns1", "hostname1", "banner", "state-dir"];
        let mut router = blank_router();
        let mut highest: BTreeMap<&str, u32> = BTreeMap::new();

        for (which, version) in updates {
            let id = ids[which];
            let before = router.version_of(id);
            router.record_version(id, version);
            let after = router.version_of(id);

            prop_assert!(after >= before);
            prop_assert!(after >= version);
            let best = highest.entry(id).or_insert(0);
            *best = (*best).max(version);
            prop_assert_eq!(after, *best);
        }
    }

    #[test]
    fn decreasing_sort_keys_rejected(sorts in prop::collection::vec(-50i64..50, 1..8)) {
        let parsed = CoterieModule::from_source("generated", &module_source(&sorts));
        let ordered = sorts.windows(2).all(|pair| pair[0] <= pair[1]);
        prop_assert_eq!(parsed.is_ok(), ordered);
    }

    #[test]
    fn elected_coteries_are_sorted(mut sorts in prop::collection::vec(-50i64..50, 1..8)) {
        sorts.sort();
        let module = CoterieModule::from_source("generated", &module_source(&sorts)).unwrap();
        let elected = elect(&[&module]).unwrap();

        prop_assert_eq!(elected.len(), sorts.len());
        prop_assert!(elected.windows(2).all(|pair| pair[0].sort <= pair[1].sort));
        // Equal sort keys keep module order
        for pair in elected.windows(2) {
            if pair[0].sort == pair[1].sort {
                let first: usize = pair[0].id[1..].parse().unwrap();
                let second: usize = pair[1].id[1..].parse().unwrap();
                prop_assert!(first < second);
            }
        }
    }
}
