mod support;

mod provisioning_tests;
