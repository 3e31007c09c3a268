//! Zone Topology Tests
//!
//! Covers closure computation, the direct/transitive distinction and the depth cap that keeps
//! misconfigured (cyclic) zone graphs from looping forever.

#[cfg(test)]
mod tests {
    use crate::zone::{MAX_ZONE_DEPTH, Zone, ZoneTopology};

    fn europe() -> ZoneTopology {
        ZoneTopology::from_zones([
            Zone::new("world", &["eu"]),
            Zone::new("eu", &["eu-west", "eu-east"]),
            Zone::new("eu-west", &["eu-west-paris"]),
            Zone::new("eu-east", &[]),
        ])
    }

    #[test]
    fn test_top_zones_are_transitive() {
        let topo = europe();

        let tops = topo.get_top_zones("eu-west-paris");
        assert_eq!(tops.len(), 3);
        assert!(tops.contains("eu-west"));
        assert!(tops.contains("eu"));
        assert!(tops.contains("world"));

        assert!(topo.get_top_zones("world").is_empty());
    }

    #[test]
    fn test_sub_zones_are_transitive() {
        let topo = europe();

        let subs = topo.get_sub_zones("eu");
        assert!(subs.contains("eu-west"));
        assert!(subs.contains("eu-east"));
        assert!(subs.contains("eu-west-paris"));
        assert!(!subs.contains("world"));
    }

    #[test]
    fn test_direct_relationships() {
        let topo = europe();

        assert!(topo.is_direct_sub_zone("eu", "eu-west"));
        assert!(!topo.is_direct_sub_zone("eu", "eu-west-paris"));
        assert!(topo.is_sub_zone("eu", "eu-west-paris"));

        assert!(topo.is_direct_top_zone("eu-west", "eu"));
        assert!(!topo.is_direct_top_zone("eu-west", "world"));
        assert!(topo.is_top_zone("eu-west", "world"));
    }

    #[test]
    fn test_siblings_are_unrelated() {
        let topo = europe();

        assert!(!topo.is_top_zone("eu-west", "eu-east"));
        assert!(!topo.is_sub_zone("eu-west", "eu-east"));
        assert!(!topo.is_direct_sub_zone("eu-east", "eu-west"));
    }

    #[test]
    fn test_unknown_zone_has_no_relatives() {
        let topo = europe();

        assert!(topo.get_top_zones("mars").is_empty());
        assert!(topo.get_sub_zones("mars").is_empty());
        assert!(!topo.is_top_zone("mars", "eu"));
    }

    #[test]
    fn test_adding_zone_invalidates_cache() {
        let topo = europe();
        assert!(topo.get_sub_zones("eu-east").is_empty());

        topo.add(Zone::new("eu-east", &["eu-east-warsaw"]));

        assert!(topo.is_direct_sub_zone("eu-east", "eu-east-warsaw"));
        assert!(topo.is_top_zone("eu-east-warsaw", "world"));
    }

    #[test]
    fn test_nameless_zone_is_ignored() {
        let topo = ZoneTopology::new();
        topo.add(Zone::new("", &["orphan"]));

        assert!(topo.get_zones().is_empty());
    }

    #[test]
    fn test_cycle_does_not_loop_and_excludes_origin() {
        let topo = ZoneTopology::from_zones([
            Zone::new("a", &["b"]),
            Zone::new("b", &["c"]),
            Zone::new("c", &["a"]),
        ]);

        let subs = topo.get_sub_zones("a");
        assert_eq!(subs.len(), 2);
        assert!(!subs.contains("a"));
        assert!(!topo.is_top_zone("a", "a"));
    }

    #[test]
    fn test_deep_chain_is_truncated() {
        let depth = MAX_ZONE_DEPTH + 10;
        let topo = ZoneTopology::new();
        for i in 0..depth {
            let sub = format!("z{}", i + 1);
            topo.add(Zone {
                name: format!("z{}", i),
                sub_zones: vec![sub],
            });
        }

        let subs = topo.get_sub_zones("z0");
        assert_eq!(subs.len(), MAX_ZONE_DEPTH);
        assert!(subs.contains("z1"));
        assert!(!subs.contains(&format!("z{}", depth)));
    }

    #[test]
    fn test_zone_config_deserialization() {
        let json = r#"[{"name": "eu", "sub-zones": ["eu-west"]}, {"name": "eu-west"}]"#;
        let zones: Vec<Zone> = serde_json::from_str(json).unwrap();

        assert_eq!(zones[0].sub_zones, vec!["eu-west".to_string()]);
        assert!(zones[1].sub_zones.is_empty());
    }
}
