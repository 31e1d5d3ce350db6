//! Group-visibility rule tests: every transitively required group must
//! appear in a function's explicit group list, with a distinct error per
//! violation origin (direct use, transitive call, pointer dereference,
//! goto-mode preservation).

use bitflags as _;
use log as _;
use proptest as _;
#[cfg(feature = "serde")]
use serde as _;
use tempfile as _;

mod common;

use common::{
    def_fn, def_group_data, def_group_vars, def_var, explicit_vars_mods, goto_mode_def, loc,
    mode_fn, nmi_fn, parse_ctx, run_to_precheck, simple_fn, tracked_calls, tracked_gvars,
    TestEval,
};
use compiler_core::ast::FnDef;
use compiler_core::fns::{DerefInfo, FnClass, PrecheckTracked};
use compiler_core::pool::PoolId;
use compiler_core::types::Type;
use rstest::rstest;

#[test]
fn direct_use_of_an_excluded_group_is_rejected() {
    // fn f() : vars(/g1) { read(v2); }  where v2 is in /g2
    let ctx = parse_ctx();
    let g1 = def_group_vars(&ctx, 1, "/g1");
    let g2 = def_group_vars(&ctx, 2, "/g2");
    let (v2_global, v2) = def_var(&ctx, 3, "v2", Type::U8, g2, None, &[]);

    let (_, f_fn) = def_fn(
        &ctx,
        4,
        "f",
        FnClass::Fn,
        FnDef::default(),
        Some(explicit_vars_mods(4, &[g1.0])),
        &[v2_global],
    );

    let eval = TestEval::new().with_tracked(f_fn, tracked_gvars(&[(v2, 5)]));
    let err = run_to_precheck(&ctx, &eval).unwrap_err();
    assert!(err.to_string().contains("/g2"), "{err}");
    assert!(err.to_string().contains("excluded"), "{err}");
    assert!(err.diagnostic.cites(&loc(5)));
}

#[test]
fn transitive_call_requiring_an_excluded_group_is_rejected() {
    let ctx = parse_ctx();
    let g1 = def_group_vars(&ctx, 1, "/g1");
    let g2 = def_group_vars(&ctx, 2, "/g2");
    let (v2_global, v2) = def_var(&ctx, 3, "v2", Type::U8, g2, None, &[]);

    // fn helper() { v2 = ...; }  (no explicit list, so no local error)
    let (helper_global, helper_fn) = simple_fn(&ctx, 4, "helper", &[v2_global]);

    // fn f() : vars(/g1) { helper(); }
    let mut def = FnDef::default();
    def.referenced.push((helper_global, loc(6)));
    let (_, f_fn) = def_fn(
        &ctx,
        5,
        "f",
        FnClass::Fn,
        def,
        Some(explicit_vars_mods(5, &[g1.0])),
        &[helper_global],
    );

    let eval = TestEval::new()
        .with_tracked(helper_fn, tracked_gvars(&[(v2, 4)]))
        .with_tracked(f_fn, tracked_calls(&[(helper_fn, 6)]));
    let err = run_to_precheck(&ctx, &eval).unwrap_err();
    assert!(err.to_string().contains("helper"), "{err}");
    assert!(err.to_string().contains("/g2"), "{err}");
    assert!(err.diagnostic.cites(&loc(6)));
}

#[rstest]
#[case::vars_group(true)]
#[case::data_group(false)]
fn pointer_deref_into_an_excluded_group_is_rejected(#[case] vars_group: bool) {
    let ctx = parse_ctx();
    let listed = def_group_vars(&ctx, 1, "/listed");
    let (excluded_group, deref_ty) = if vars_group {
        let g = def_group_vars(&ctx, 2, "/ram");
        (g.0, Type::ptr(vec![g.0], false))
    } else {
        let g = def_group_data(&ctx, 2, "/rom");
        (g.0, Type::ptr(vec![g.0], false))
    };

    let mut mods = explicit_vars_mods(3, &[listed.0]);
    mods.explicit_group_data = true;
    let (_, f_fn) = def_fn(&ctx, 3, "f", FnClass::Fn, FnDef::default(), Some(mods), &[]);

    let tracked = PrecheckTracked {
        deref_groups: vec![(
            excluded_group,
            DerefInfo {
                ty: deref_ty,
                loc: loc(7),
            },
        )],
        ..PrecheckTracked::default()
    };
    let eval = TestEval::new().with_tracked(f_fn, tracked);
    let err = run_to_precheck(&ctx, &eval).unwrap_err();
    assert!(err.to_string().contains("excluded"), "{err}");
    assert!(err.diagnostic.cites(&loc(7)));
    let expected_keyword = if vars_group { "vars" } else { "data" };
    assert!(err.to_string().contains(expected_keyword), "{err}");
}

#[test]
fn goto_mode_preserving_an_excluded_group_is_rejected() {
    let ctx = parse_ctx();
    let g1 = def_group_vars(&ctx, 1, "/g1");
    let g2 = def_group_vars(&ctx, 2, "/g2");
    let (n_global, _) = nmi_fn(&ctx, 3, "n", &[]);
    let m2_target = ctx.lookup(loc(9), "m2");
    let (_, m2_fn) = mode_fn(&ctx, 4, "m2", n_global, &[]);

    // fn f() : vars(/g1) { goto mode m2 : vars(/g2); }
    let (_, f_fn) = def_fn(
        &ctx,
        5,
        "f",
        FnClass::Fn,
        goto_mode_def(6, m2_target, Some(g2.0)),
        Some(explicit_vars_mods(5, &[g1.0])),
        &[],
    );

    let tracked = PrecheckTracked {
        goto_modes: vec![(m2_fn, 0)],
        ..PrecheckTracked::default()
    };
    let eval = TestEval::new().with_tracked(f_fn, tracked);
    let err = run_to_precheck(&ctx, &eval).unwrap_err();
    assert!(err.to_string().contains("preserved groups"), "{err}");
    assert!(err.diagnostic.cites(&loc(6)));
}

#[test]
fn goto_mode_without_a_vars_modifier_is_rejected() {
    let ctx = parse_ctx();
    let (n_global, _) = nmi_fn(&ctx, 1, "n", &[]);
    let m2_target = ctx.lookup(loc(9), "m2");
    let (_, m2_fn) = mode_fn(&ctx, 2, "m2", n_global, &[]);

    let (_, f_fn) = def_fn(
        &ctx,
        3,
        "f",
        FnClass::Fn,
        goto_mode_def(4, m2_target, None),
        None,
        &[],
    );

    let tracked = PrecheckTracked {
        goto_modes: vec![(m2_fn, 0)],
        ..PrecheckTracked::default()
    };
    let eval = TestEval::new().with_tracked(f_fn, tracked);
    let err = run_to_precheck(&ctx, &eval).unwrap_err();
    assert!(err.to_string().contains("missing vars modifier"), "{err}");
    assert!(err.diagnostic.cites(&loc(4)));
}

#[test]
fn preserving_a_group_the_target_mode_excludes_warns() {
    let ctx = parse_ctx();
    let g1 = def_group_vars(&ctx, 1, "/g1");
    let (n_global, _) = nmi_fn(&ctx, 2, "n", &[]);
    let m2_target = ctx.lookup(loc(9), "m2");
    let (_, m2_fn) = mode_fn(&ctx, 3, "m2", n_global, &[]);

    // fn f() { goto mode m2 : vars(/g1); }  m2 itself never touches /g1.
    let (_, f_fn) = def_fn(
        &ctx,
        4,
        "f",
        FnClass::Fn,
        goto_mode_def(5, m2_target, Some(g1.0)),
        None,
        &[],
    );

    let tracked = PrecheckTracked {
        goto_modes: vec![(m2_fn, 0)],
        ..PrecheckTracked::default()
    };
    let eval = TestEval::new().with_tracked(f_fn, tracked);
    run_to_precheck(&ctx, &eval).unwrap();

    let warnings = ctx.take_warnings();
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    let text = warnings[0].to_string();
    assert!(text.contains("has no effect"), "{text}");
    assert!(text.contains("/g1"), "{text}");
    assert!(warnings[0].cites(&loc(5)));
}

#[test]
fn listed_groups_bound_the_precheck_group_set() {
    // Property: with an explicit list, the touched set stays inside it.
    let ctx = parse_ctx();
    let g1 = def_group_vars(&ctx, 1, "/g1");
    let g2 = def_group_vars(&ctx, 2, "/g2");
    let (v1_global, v1) = def_var(&ctx, 3, "v1", Type::U8, g1, None, &[]);

    let (_, f_fn) = def_fn(
        &ctx,
        4,
        "f",
        FnClass::Fn,
        FnDef::default(),
        Some(explicit_vars_mods(4, &[g1.0, g2.0])),
        &[v1_global],
    );

    let eval = TestEval::new().with_tracked(f_fn, tracked_gvars(&[(v1, 4)]));
    run_to_precheck(&ctx, &eval).unwrap();

    let f = ctx.fns().get(f_fn);
    let touched = &f.precheck().group_vars;
    // The declared list is unioned in; nothing outside it appears.
    assert!(touched.test(g1.1.index() as usize));
    assert!(touched.test(g2.1.index() as usize));
    assert_eq!(touched.count(), 2);

    // And the gmember range of v1 lands in the rw set.
    let (begin, count) = ctx.gvars().get(v1).gmember_range().unwrap();
    assert_eq!(count, 1);
    assert!(f.precheck().rw.test(begin.index() as usize));
}

#[test]
fn vars_list_naming_a_data_group_is_rejected_at_parse_cleanup() {
    let ctx = parse_ctx();
    let rom = def_group_data(&ctx, 1, "/rom");
    def_fn(
        &ctx,
        2,
        "f",
        FnClass::Fn,
        FnDef::default(),
        Some(explicit_vars_mods(2, &[rom.0])),
        &[],
    );

    let err = ctx.parse_cleanup().unwrap_err();
    assert!(err.to_string().contains("is not a vars group"), "{err}");
}

#[test]
fn conflicting_group_classes_are_a_redefinition_error() {
    let ctx = parse_ctx();
    def_group_vars(&ctx, 1, "/g");
    let err = ctx.define_group_data(loc(2), "/g").unwrap_err();
    assert!(err.to_string().contains("already defined"), "{err}");
    assert!(err.diagnostic.cites(&loc(1)));
    assert!(err.diagnostic.cites(&loc(2)));

    // Same-class redefinition merges instead.
    let (group, vars) = def_group_vars(&ctx, 3, "/g");
    assert_eq!(def_group_vars(&ctx, 4, "/g"), (group, vars));
}
